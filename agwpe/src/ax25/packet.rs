use super::address::{decode_addresses, encode_addresses, Digipeater, Path};
use crate::callsign::CallSign;
use crate::error::Error;

/// PID value meaning "no layer 3 protocol" (AX.25 2.2, used on I/UI frames
/// that carry raw bytes rather than a routed protocol).
pub const PID_NO_LAYER3: u8 = 0xF0;

/// PID values that indicate an escaped, second PID byte follows (spec §4.2).
/// `0xFF` is AX.25 2.2's own "extended PID follows" escape; `0x08` is a
/// second escape value some TNCs emit for an additional layer-3 PID octet.
/// Both are handled identically: consume one extra byte.
pub const PID_ESCAPE: u8 = 0xFF;
pub const PID_ESCAPE_ALT: u8 = 0x08;

fn pid_is_escape(byte: u8) -> bool {
	byte == PID_ESCAPE || byte == PID_ESCAPE_ALT
}

/// The AX.25 frame type (spec §3). `XID`'s parameter bytes are treated as an
/// opaque blob rather than individually parsed (see SPEC_FULL.md's
/// Supplemented features: XID-as-opaque-bytes decision).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Type {
	I,
	UI,
	SABM,
	SABME,
	DISC,
	DM,
	UA,
	FRMR,
	RR,
	RNR,
	REJ,
	SREJ,
	XID,
	TEST,
}

impl Type {
	/// Control-byte base value with P/F and N(R)/N(S) bits cleared (AX.25 2.2).
	fn base(self) -> u8 {
		match self {
			Type::I => 0x00,
			Type::RR => 0x01,
			Type::RNR => 0x05,
			Type::REJ => 0x09,
			Type::SREJ => 0x0D,
			Type::UI => 0x03,
			Type::SABM => 0x2F,
			Type::SABME => 0x6F,
			Type::DISC => 0x43,
			Type::DM => 0x0F,
			Type::UA => 0x63,
			Type::FRMR => 0x87,
			Type::XID => 0xAF,
			Type::TEST => 0xE3,
		}
	}

	fn is_information(self) -> bool {
		matches!(self, Type::I)
	}

	fn is_supervisory(self) -> bool {
		matches!(self, Type::RR | Type::RNR | Type::REJ | Type::SREJ)
	}

	fn is_unnumbered(self) -> bool {
		!self.is_information() && !self.is_supervisory()
	}

	fn carries_pid(self) -> bool {
		matches!(self, Type::I | Type::UI)
	}

	/// Decode a control byte into its type, N(R), N(S), and raw P/F bit. The
	/// P/F bit's meaning for supervisory frames is resolved by the caller
	/// against the address-field marker bits (see [`decode`]).
	fn decode_control(byte: u8) -> Result<(Type, Option<u8>, Option<u8>, bool), Error> {
		if byte & 0x01 == 0 {
			let ty = Type::I;
			let ns = (byte >> 1) & 0x07;
			let nr = (byte >> 5) & 0x07;
			let pf = byte & 0x10 != 0;
			return Ok((ty, Some(nr), Some(ns), pf));
		}

		if byte & 0x03 == 0x01 {
			let ty = match byte & 0x0F {
				0x01 => Type::RR,
				0x05 => Type::RNR,
				0x09 => Type::REJ,
				0x0D => Type::SREJ,
				_ => return Err(Error::MalformedPacket("unknown supervisory control byte")),
			};
			let nr = (byte >> 5) & 0x07;
			return Ok((ty, Some(nr), None, false));
		}

		let masked = byte & !0x10;
		let pf = byte & 0x10 != 0;
		let ty = match masked {
			0x03 => Type::UI,
			0x2F => Type::SABM,
			0x6F => Type::SABME,
			0x43 => Type::DISC,
			0x0F => Type::DM,
			0x63 => Type::UA,
			0x87 => Type::FRMR,
			0xAF => Type::XID,
			0xE3 => Type::TEST,
			_ => return Err(Error::MalformedPacket("unknown unnumbered control byte")),
		};

		Ok((ty, None, None, pf))
	}

	fn encode_control(self, nr: Option<u8>, ns: Option<u8>, pf: bool) -> u8 {
		let mut byte = self.base();

		if self.is_information() {
			byte |= ns.unwrap_or(0) << 1;
			byte |= nr.unwrap_or(0) << 5;
			byte |= (pf as u8) << 4;
		} else if self.is_supervisory() {
			byte |= nr.unwrap_or(0) << 5;
			// P/F for supervisory frames rides the address-field marker bits
			// instead of bit 4 (spec §4.2); bit 4 stays clear here.
		} else {
			byte |= (pf as u8) << 4;
		}

		byte
	}
}

/// The object form of a decoded or to-be-encoded AX.25 packet (spec §3).
#[derive(Clone, Debug)]
pub struct Packet {
	pub to: CallSign,
	pub from: CallSign,
	pub path: Path,
	pub ty: Type,
	pub command: bool,
	pub response: bool,
	pub p: bool,
	pub f: bool,
	pub nr: Option<u8>,
	pub ns: Option<u8>,
	pub pid: Option<u8>,
	/// Second PID byte, present only when `pid` is an escape value (spec §4.2).
	pub pid_ext: Option<u8>,
	pub info: Vec<u8>,
}

impl Packet {
	/// Validate and encode this packet to its wire bytes.
	pub fn encode(&self) -> Result<Vec<u8>, Error> {
		if self.command && self.response {
			return Err(Error::MalformedPacket("command and response are mutually exclusive"));
		}

		if self.p && self.f {
			return Err(Error::MalformedPacket("poll and final are mutually exclusive"));
		}

		if !self.info.is_empty() && !self.ty.carries_pid() {
			return Err(Error::MalformedPacket("info field is only valid on I/UI frames"));
		}

		if self.ty.is_supervisory() && (self.command != self.p || self.response != self.f) {
			// The wire format has only one bit per address field for supervisory
			// frames; command/response and P/F must agree (see SPEC_FULL.md's
			// open-question decision on control-byte encoding).
			return Err(Error::MalformedPacket("supervisory frame command/response must match P/F"));
		}

		let mut out = encode_addresses(self.to, self.from, &self.path, self.command, self.response);

		out.push(self.ty.encode_control(self.nr, self.ns, self.p || self.f));

		if self.ty.carries_pid() {
			let pid = self.pid.unwrap_or(PID_NO_LAYER3);
			out.push(pid);

			if pid_is_escape(pid) {
				let ext = self.pid_ext.ok_or(Error::MalformedPacket("escaped PID missing its second byte"))?;
				out.push(ext);
			} else if self.pid_ext.is_some() {
				return Err(Error::MalformedPacket("pid_ext is only valid when pid is an escape value"));
			}
		} else if self.pid_ext.is_some() {
			return Err(Error::MalformedPacket("pid_ext is only valid on I/UI frames"));
		}

		out.extend_from_slice(&self.info);

		Ok(out)
	}

	/// Decode a packet from its wire bytes.
	pub fn decode(buf: &[u8]) -> Result<Self, Error> {
		let addrs = decode_addresses(buf)?;
		let rest = &buf[addrs.consumed..];

		let &control = rest.first().ok_or(Error::MalformedPacket("missing control byte"))?;
		let (ty, nr, ns, pf_bit) = Type::decode_control(control)?;

		let (command, response, p, f) = if ty.is_supervisory() {
			(addrs.to_marker, addrs.from_marker, addrs.to_marker, addrs.from_marker)
		} else {
			(addrs.to_marker, addrs.from_marker, pf_bit, pf_bit)
		};

		let mut offset = 1;
		let (pid, pid_ext) = if ty.carries_pid() {
			let &byte = rest.get(offset).ok_or(Error::MalformedPacket("missing PID byte"))?;
			offset += 1;

			if pid_is_escape(byte) {
				let &ext = rest.get(offset).ok_or(Error::MalformedPacket("missing escaped PID byte"))?;
				offset += 1;
				(Some(byte), Some(ext))
			} else {
				(Some(byte), None)
			}
		} else {
			(None, None)
		};

		let info = rest[offset..].to_vec();

		Ok(Self {
			to: addrs.to,
			from: addrs.from,
			path: addrs.path,
			ty,
			command,
			response,
			p,
			f,
			nr,
			ns,
			pid,
			pid_ext,
			info,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn call(s: &str) -> CallSign {
		CallSign::parse(s).unwrap()
	}

	#[test]
	fn roundtrips_ui_frame() {
		let packet = Packet {
			to: call("APRS"),
			from: call("N0CALL-1"),
			path: Path::new(vec![Digipeater { call: call("WIDE1-1"), repeated: false }]).unwrap(),
			ty: Type::UI,
			command: true,
			response: false,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: Some(PID_NO_LAYER3),
			pid_ext: None,
			info: b"hello world".to_vec(),
		};

		let bytes = packet.encode().unwrap();
		let decoded = Packet::decode(&bytes).unwrap();

		assert_eq!(decoded.ty, Type::UI);
		assert_eq!(decoded.to, packet.to);
		assert_eq!(decoded.from, packet.from);
		assert_eq!(decoded.info, packet.info);
		assert!(decoded.command);
		assert_eq!(decoded.pid, Some(PID_NO_LAYER3));
	}

	#[test]
	fn roundtrips_i_frame_with_sequence_numbers() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::I,
			command: true,
			response: false,
			p: true,
			f: false,
			nr: Some(3),
			ns: Some(5),
			pid: Some(PID_NO_LAYER3),
			pid_ext: None,
			info: vec![1, 2, 3],
		};

		let bytes = packet.encode().unwrap();
		let decoded = Packet::decode(&bytes).unwrap();

		assert_eq!(decoded.ty, Type::I);
		assert_eq!(decoded.nr, Some(3));
		assert_eq!(decoded.ns, Some(5));
		assert!(decoded.p);
		assert_eq!(decoded.info, vec![1, 2, 3]);
	}

	#[test]
	fn roundtrips_supervisory_frame() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::RR,
			command: true,
			response: false,
			p: true,
			f: false,
			nr: Some(2),
			ns: None,
			pid: None,
			pid_ext: None,
			info: Vec::new(),
		};

		let bytes = packet.encode().unwrap();
		let decoded = Packet::decode(&bytes).unwrap();

		assert_eq!(decoded.ty, Type::RR);
		assert_eq!(decoded.nr, Some(2));
		assert!(decoded.p);
		assert!(decoded.command);
	}

	#[test]
	fn roundtrips_unnumbered_frame_without_pid() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::SABM,
			command: true,
			response: false,
			p: true,
			f: false,
			nr: None,
			ns: None,
			pid: None,
			pid_ext: None,
			info: Vec::new(),
		};

		let bytes = packet.encode().unwrap();
		let decoded = Packet::decode(&bytes).unwrap();

		assert_eq!(decoded.ty, Type::SABM);
		assert!(decoded.p);
		assert_eq!(decoded.pid, None);
	}

	#[test]
	fn rejects_both_command_and_response() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::DISC,
			command: true,
			response: true,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: None,
			pid_ext: None,
			info: Vec::new(),
		};

		assert!(packet.encode().is_err());
	}

	#[test]
	fn rejects_info_on_non_carrying_frame() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::DISC,
			command: true,
			response: false,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: None,
			pid_ext: None,
			info: vec![1],
		};

		assert!(packet.encode().is_err());
	}

	#[test]
	fn roundtrips_escaped_pid() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::UI,
			command: true,
			response: false,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: Some(PID_ESCAPE),
			pid_ext: Some(0x34),
			info: b"extended pid".to_vec(),
		};

		let bytes = packet.encode().unwrap();
		let decoded = Packet::decode(&bytes).unwrap();

		assert_eq!(decoded.pid, Some(PID_ESCAPE));
		assert_eq!(decoded.pid_ext, Some(0x34));
		assert_eq!(decoded.info, packet.info);
	}

	#[test]
	fn rejects_pid_ext_without_escape_pid() {
		let packet = Packet {
			to: call("N0CALL"),
			from: call("W1AW"),
			path: Path::default(),
			ty: Type::UI,
			command: true,
			response: false,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: Some(PID_NO_LAYER3),
			pid_ext: Some(0x12),
			info: Vec::new(),
		};

		assert!(packet.encode().is_err());
	}
}
