use std::time::Duration;

use crate::frame::{CallField, DataKind, Frame};
use crate::throttle::Throttle;

/// How often a `'y'` in-flight query is sent for a port while frames are
/// queued against it (spec §4.7/§4.8).
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Build a `'y'` in-flight query frame for `port` (spec §4.5/§4.7). Sent both
/// to seed a newly-created port throttle's counter and, while blocked, every
/// [`POLL_INTERVAL`].
pub fn query_frame(port: u8) -> Frame {
	Frame::control(port, DataKind::PORT_FRAMES, CallField::EMPTY, CallField::EMPTY)
}

/// Per-port flow control: frames destined for a port's [`Sender`](crate::sender::Sender)
/// are held here once the TNC's last `'y'` reply reported the port at or
/// above its high watermark, and released again once a later reply reports
/// it back down to the low watermark (spec §4.8).
pub struct PortThrottle {
	engine: Throttle<Frame>,
}

impl PortThrottle {
	pub fn new(low: u32, high: u32) -> Self {
		Self { engine: Throttle::new(low, high) }
	}

	/// Called when the TNC answers a `'y'` query for this port.
	pub fn on_query_reply(&mut self, inflight: u32) {
		self.engine.set_inflight(inflight);
	}

	/// Offer a frame to send. Returns `Some(frame)` immediately if the port is
	/// open; otherwise the frame is queued and `None` is returned.
	pub fn offer(&mut self, frame: Frame) -> Option<Frame> {
		if self.engine.is_open() && self.engine.is_queue_empty() {
			self.engine.note_dispatch(frame.data_kind.is_data_bearing());
			return Some(frame);
		}

		self.engine.enqueue(frame);
		None
	}

	/// Whether queued frames should now be released (called after a `'y'` reply).
	pub fn should_drain(&self) -> bool {
		!self.engine.is_queue_empty() && self.engine.should_resume()
	}

	/// Release one queued frame. The caller should keep calling this (checking
	/// [`should_drain`](Self::should_drain) again between calls, since sending
	/// a frame may itself change how many are in flight) until the queue is
	/// empty or the port closes again.
	pub fn drain_one(&mut self) -> Option<Frame> {
		let frame = self.engine.dequeue()?;
		self.engine.note_dispatch(frame.data_kind.is_data_bearing());
		Some(frame)
	}

	pub fn has_pending(&self) -> bool {
		!self.engine.is_queue_empty()
	}

	/// Spec §4.7's look-ahead: query now rather than waiting for the poll timer.
	pub fn wants_lookahead_query(&self) -> bool {
		self.engine.wants_lookahead_query()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::callsign::CallSign;
	use crate::frame::{CallField, DataKind};

	fn frame() -> Frame {
		let call = CallField::from_call(CallSign::parse("N0CALL").unwrap());
		Frame::control(0, DataKind::DATA, call, call)
	}

	#[test]
	fn queues_while_closed_and_releases_on_reply() {
		let mut t = PortThrottle::new(2, 4);

		t.on_query_reply(4);
		assert!(t.offer(frame()).is_none());
		assert!(t.has_pending());

		t.on_query_reply(1);
		assert!(t.should_drain());
		assert!(t.drain_one().is_some());
		assert!(!t.has_pending());
	}

	#[test]
	fn passes_through_when_open_and_idle() {
		let mut t = PortThrottle::new(2, 4);
		assert!(t.offer(frame()).is_some());
	}
}
