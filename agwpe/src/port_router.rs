use std::collections::HashMap;

use utils::error::Result;

use crate::error::Error;
use crate::frame::Frame;
use crate::port_throttle::PortThrottle;

/// Capabilities reported by a port's `'g'` reply (see
/// `other_examples/364d1735_ThomasHabets-agw` for the field layout this is
/// grounded on).
#[derive(Clone, Copy, Debug)]
pub struct PortCaps {
	pub rate: u8,
	pub traffic_level: u8,
	pub tx_delay: u8,
	pub tx_tail: u8,
	pub persist: u8,
	pub slot_time: u8,
	pub max_frame: u8,
	pub active_connections: u8,
	pub bytes_per_2min: u32,
}

impl PortCaps {
	pub fn decode(data: &[u8]) -> Result<Self, Error> {
		if data.len() < 12 {
			return Err(Error::MalformedFrame("'g' reply shorter than expected"));
		}

		Ok(Self {
			rate: data[0],
			traffic_level: data[1],
			tx_delay: data[2],
			tx_tail: data[3],
			persist: data[4],
			slot_time: data[5],
			max_frame: data[6],
			active_connections: data[7],
			bytes_per_2min: u32::from_le_bytes(data[8..12].try_into().expect("checked above")),
		})
	}
}

struct PortEntry {
	description: Option<String>,
	caps: Option<PortCaps>,
	throttle: PortThrottle,
}

impl PortEntry {
	fn new() -> Self {
		Self { description: None, caps: None, throttle: PortThrottle::new(2, 8) }
	}
}

/// Tracks every TNC port this client has heard about or addressed, gating
/// outbound data-bearing frames through that port's [`PortThrottle`] (spec
/// §4.5).
#[derive(Default)]
pub struct PortRouter {
	ports: HashMap<u8, PortEntry>,
}

impl PortRouter {
	pub fn new() -> Self {
		Self::default()
	}

	fn entry(&mut self, port: u8) -> &mut PortEntry {
		self.ports.entry(port).or_insert_with(PortEntry::new)
	}

	/// Ensure a [`PortThrottle`] exists for `port`, reporting whether this
	/// call is what created it (spec §4.5: "creating a Port throttle also...
	/// immediately issues a 'y' query to initialize inFlight"). Called on
	/// both the first inbound frame for a port and the first outbound use
	/// (`createConnection`/`write`).
	pub fn ensure_port(&mut self, port: u8) -> bool {
		use std::collections::hash_map::Entry;

		match self.ports.entry(port) {
			Entry::Occupied(_) => false,
			Entry::Vacant(v) => {
				v.insert(PortEntry::new());
				true
			}
		}
	}

	/// Parse the `'G'` port-list payload (`"N;desc1;desc2;...;descN"`, one-indexed
	/// by the order ports appear) and record each description.
	pub fn on_port_info(&mut self, payload: &[u8]) -> Result<(), Error> {
		let text = core::str::from_utf8(payload).map_err(|_| Error::MalformedFrame("'G' reply is not valid UTF-8"))?;
		let mut parts = text.split(';');

		let count: usize = parts.next().unwrap_or("").trim().parse().map_err(|_| Error::MalformedFrame("'G' reply missing port count"))?;

		if count == 0 {
			return Err(Error::NoPorts);
		}

		for (port, desc) in (0u8..).zip(parts) {
			self.entry(port).description = Some(desc.trim().to_string());
		}

		Ok(())
	}

	pub fn on_port_caps(&mut self, port: u8, payload: &[u8]) -> Result<(), Error> {
		self.entry(port).caps = Some(PortCaps::decode(payload)?);
		Ok(())
	}

	pub fn description(&self, port: u8) -> Option<&str> {
		self.ports.get(&port).and_then(|e| e.description.as_deref())
	}

	pub fn caps(&self, port: u8) -> Option<PortCaps> {
		self.ports.get(&port).and_then(|e| e.caps)
	}

	pub fn known_port(&self, port: u8) -> bool {
		self.ports.contains_key(&port)
	}

	/// Offer a data-bearing frame to send on `frame.tnc_port`. Returns the
	/// frame immediately if the port is open, otherwise queues it.
	pub fn offer(&mut self, frame: Frame) -> Option<Frame> {
		self.entry(frame.tnc_port).throttle.offer(frame)
	}

	pub fn on_frames_outstanding(&mut self, port: u8, inflight: u32) {
		self.entry(port).throttle.on_query_reply(inflight);
	}

	pub fn should_drain(&self, port: u8) -> bool {
		self.ports.get(&port).is_some_and(|e| e.throttle.should_drain())
	}

	pub fn drain_one(&mut self, port: u8) -> Option<Frame> {
		self.entry(port).throttle.drain_one()
	}

	pub fn has_pending(&self, port: u8) -> bool {
		self.ports.get(&port).is_some_and(|e| e.throttle.has_pending())
	}

	/// Spec §4.7's look-ahead: query now rather than waiting for the poll timer.
	pub fn wants_lookahead_query(&self, port: u8) -> bool {
		self.ports.get(&port).is_some_and(|e| e.throttle.wants_lookahead_query())
	}

	pub fn ports(&self) -> impl Iterator<Item = u8> + '_ {
		self.ports.keys().copied()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_port_info_list() {
		let mut router = PortRouter::new();
		router.on_port_info(b"2;TNC Port 1: 1200 baud;TNC Port 2: 9600 baud").unwrap();

		assert_eq!(router.description(0), Some("TNC Port 1: 1200 baud"));
		assert_eq!(router.description(1), Some("TNC Port 2: 9600 baud"));
	}

	#[test]
	fn rejects_zero_ports() {
		let mut router = PortRouter::new();
		assert!(router.on_port_info(b"0").is_err());
	}

	#[test]
	fn decodes_port_caps() {
		let payload = [1, 2, 3, 4, 5, 6, 7, 8, 9, 0, 0, 0];
		let caps = PortCaps::decode(&payload).unwrap();
		assert_eq!(caps.max_frame, 7);
		assert_eq!(caps.bytes_per_2min, 9);
	}

	#[test]
	fn ensure_port_reports_creation_once() {
		let mut router = PortRouter::new();
		assert!(router.ensure_port(3));
		assert!(!router.ensure_port(3));
		assert!(!router.ensure_port(3));
	}
}
