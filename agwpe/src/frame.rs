use collections::bytes::{Bytes, Cursor};
use utils::bytes::Cast;
use utils::endian::u32le;

use crate::callsign::CallSign;
use crate::error::Error;

/// The size in bytes of the fixed AGWPE header, excluding payload.
pub const HEADER_LEN: usize = 36;

/// Sentinel PID value meaning "no protocol" (used for frames that carry no PID,
/// e.g. port queries).
pub const PID_NONE: u8 = 0xF0;

/// The on-the-wire AGWPE header, byte-for-byte (see spec §4.1). Every integer
/// is little-endian; `Cast` lets us read and write it directly as bytes with no
/// intermediate parsing.
#[derive(Cast)]
#[repr(C)]
pub struct Header {
	pub tnc_port: u8,
	reserved0: [u8; 3],
	pub data_kind: u8,
	reserved1: u8,
	pub pid: u8,
	reserved2: u8,
	pub call_from: [u8; 10],
	pub call_to: [u8; 10],
	pub payload_len: u32le,
	pub user: u32le,
}

/// A single ASCII byte identifying an AGWPE frame's command/response class (see
/// spec §6's dataKind dictionary, supplemented per SPEC_FULL.md with 'R'/'H' and
/// the monitor-mode kinds 'I'/'S'/'U'/'T').
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataKind(pub u8);

impl DataKind {
	pub const PORT_INFO: Self = Self(b'G');
	pub const PORT_CAPS: Self = Self(b'g');
	pub const REGISTER: Self = Self(b'X');
	pub const CONNECT: Self = Self(b'C');
	pub const CONNECT_VIA: Self = Self(b'v');
	pub const DATA: Self = Self(b'D');
	pub const DISCONNECT: Self = Self(b'd');
	pub const CONN_FRAMES: Self = Self(b'Y');
	pub const PORT_FRAMES: Self = Self(b'y');
	pub const RAW: Self = Self(b'K');
	pub const RAW_TOGGLE: Self = Self(b'k');
	pub const UNPROTO: Self = Self(b'M');
	pub const UNPROTO_VIA: Self = Self(b'V');
	pub const VERSION: Self = Self(b'R');
	pub const HEARD: Self = Self(b'H');
	pub const MONITOR_CONNECTED: Self = Self(b'I');
	pub const MONITOR_SUPERVISORY: Self = Self(b'S');
	pub const MONITOR_UNPROTO: Self = Self(b'U');
	pub const MONITOR_SENT: Self = Self(b'T');

	/// Data-bearing frames occupy the radio; everything else is TNC-local
	/// bookkeeping and does not count against a throttle's in-flight budget.
	pub fn is_data_bearing(self) -> bool {
		matches!(self, Self::DATA | Self::RAW | Self::UNPROTO | Self::UNPROTO_VIA)
	}
}

impl core::fmt::Debug for DataKind {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "'{}'", self.0 as char)
	}
}

/// A call-sign field as it appears on the wire in an AGWPE header: plain ASCII
/// text (e.g. `"N0CALL-5"`), NUL-padded to 10 bytes. Distinct from the 7-byte
/// shifted-ASCII address field used by the AX.25 packet codec (`ax25::address`).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CallField(pub [u8; 10]);

impl CallField {
	pub const EMPTY: Self = Self([0; 10]);

	pub fn from_call(call: CallSign) -> Self {
		let text = call.to_string();
		let bytes = text.as_bytes();

		assert!(bytes.len() <= 9, "call sign text must fit in a 9-byte field");

		let mut buf = [0u8; 10];
		buf[..bytes.len()].copy_from_slice(bytes);

		Self(buf)
	}

	/// Parse the field as a call sign. Returns `None` for an all-NUL (empty) field.
	pub fn as_call(&self) -> Result<Option<CallSign>, Error> {
		let end = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());

		if end == 0 {
			return Ok(None);
		}

		let text = core::str::from_utf8(&self.0[..end]).map_err(|_| Error::MalformedFrame("non-ASCII call sign field"))?;

		CallSign::parse(text).map(Some)
	}
}

/// The object form of an AGWPE frame (spec §3).
pub struct Frame {
	pub tnc_port: u8,
	pub data_kind: DataKind,
	pub pid: u8,
	pub call_from: CallField,
	pub call_to: CallField,
	pub user: u32,
	pub payload: Bytes,
}

impl Frame {
	/// Construct a frame with no payload and `PID_NONE`, the shape most control
	/// frames ('G', 'X', 'y', 'Y', 'k', 'd', ...) take.
	pub fn control(tnc_port: u8, data_kind: DataKind, call_from: CallField, call_to: CallField) -> Self {
		Self {
			tnc_port,
			data_kind,
			pid: PID_NONE,
			call_from,
			call_to,
			user: 0,
			payload: Bytes::new(0),
		}
	}

	pub fn with_payload(mut self, payload: Bytes) -> Self {
		self.payload = payload;
		self
	}

	pub fn with_pid(mut self, pid: u8) -> Self {
		self.pid = pid;
		self
	}

	/// Total encoded size in bytes, header plus payload.
	pub fn encoded_len(&self) -> usize {
		HEADER_LEN + self.payload.len()
	}

	/// Write this frame's wire bytes to `cursor`.
	pub fn encode(&self, cursor: Cursor) {
		let header = Header {
			tnc_port: self.tnc_port,
			reserved0: [0; 3],
			data_kind: self.data_kind.0,
			reserved1: 0,
			pid: self.pid,
			reserved2: 0,
			call_from: self.call_from.0,
			call_to: self.call_to.0,
			payload_len: (self.payload.len() as u32).into(),
			user: self.user.into(),
		};

		cursor.push(&header).push(&*self.payload);
	}

	/// Build the object form from a decoded header and a freshly-sliced payload.
	fn from_wire(header: &Header, payload: Bytes) -> Self {
		Self {
			tnc_port: header.tnc_port,
			data_kind: DataKind(header.data_kind),
			pid: header.pid,
			call_from: CallField(header.call_from),
			call_to: CallField(header.call_to),
			user: header.user.get(),
			payload,
		}
	}
}

/// Decode a 36-byte header buffer in isolation (used by the Receiver once it has
/// topped up its header buffer).
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> &Header {
	utils::bytes::cast(buf)
}

/// Combine a decoded header with its payload into the object form.
pub fn assemble(header: &Header, payload: Bytes) -> Frame {
	Frame::from_wire(header, payload)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(frame: Frame) -> Frame {
		let mut vec = vec![0u8; frame.encoded_len()];
		Cursor::vec(&mut vec, |cursor| frame.encode(cursor));

		let mut header_buf = [0u8; HEADER_LEN];
		header_buf.copy_from_slice(&vec[..HEADER_LEN]);
		let header = decode_header(&header_buf);

		let mut payload = Bytes::new(vec.len() - HEADER_LEN);
		payload.copy_from_slice(&vec[HEADER_LEN..]);

		assemble(header, payload)
	}

	#[test]
	fn header_roundtrips_fields() {
		let call_from = CallField::from_call(CallSign::parse("N0CALL").unwrap());
		let call_to = CallField::from_call(CallSign::parse("W1AW-5").unwrap());

		let original = Frame::control(3, DataKind::DATA, call_from, call_to)
			.with_pid(0xF0)
			.with_payload({
				let mut b = Bytes::new(2);
				b.copy_from_slice(b"HI");
				b
			});

		let decoded = roundtrip(original);

		assert_eq!(decoded.tnc_port, 3);
		assert_eq!(decoded.data_kind, DataKind::DATA);
		assert_eq!(decoded.pid, 0xF0);
		assert_eq!(&*decoded.payload, b"HI");
		assert_eq!(decoded.call_from.as_call().unwrap().unwrap().to_string(), "N0CALL");
		assert_eq!(decoded.call_to.as_call().unwrap().unwrap().to_string(), "W1AW-5");
	}

	#[test]
	fn data_bearing_kinds_match_glossary() {
		assert!(DataKind::DATA.is_data_bearing());
		assert!(DataKind::RAW.is_data_bearing());
		assert!(DataKind::UNPROTO.is_data_bearing());
		assert!(DataKind::UNPROTO_VIA.is_data_bearing());
		assert!(!DataKind::PORT_INFO.is_data_bearing());
		assert!(!DataKind::DISCONNECT.is_data_bearing());
	}

	#[test]
	fn empty_call_field_is_none() {
		assert!(CallField::EMPTY.as_call().unwrap().is_none());
	}
}
