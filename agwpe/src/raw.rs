use crate::ax25::Packet;
use crate::error::Error;
use crate::frame::{CallField, DataKind, Frame};

/// A monitor-mode event surfaced to the application: either a fully decoded
/// AX.25 packet from raw mode (`'K'`), or an opaque line of monitor text from
/// one of the `'I'`/`'S'`/`'U'`/`'T'` kinds (SPEC_FULL.md's supplemented
/// monitor-mode kinds), which this implementation does not attempt to parse
/// further (see `other_examples/364d1735_ThomasHabets-agw`, which treats
/// these identically as opaque byte vectors).
#[derive(Debug)]
pub enum MonitorEvent {
	/// A raw-mode AX.25 packet received on `port`.
	Raw { port: u8, packet: Packet },
	/// An opaque monitor line: connected-mode, supervisory, unproto, or sent.
	Monitor { port: u8, kind: DataKind, text: Vec<u8> },
}

/// Decode a `'K'` frame's payload: a leading port-number byte (redundant with
/// the AGWPE header's own `tnc_port`, but present on the wire for historical
/// reasons) followed by the raw AX.25 frame.
pub fn decode_raw_payload(payload: &[u8]) -> Result<Packet, Error> {
	let ax25_bytes = payload.get(1..).ok_or(Error::MalformedFrame("'K' payload missing AX.25 frame"))?;
	Packet::decode(ax25_bytes)
}

/// Encode a packet for injection via `'K'` (spec §6): `[tncPort << 4]`
/// followed by the packet's wire bytes, wrapped in the AGWPE frame envelope.
pub fn encode_raw_frame(tnc_port: u8, packet: &Packet) -> Result<Frame, Error> {
	let mut payload = Vec::with_capacity(1 + 64);
	payload.push(tnc_port << 4);
	payload.extend_from_slice(&packet.encode()?);

	let mut bytes = collections::bytes::Bytes::new(payload.len());
	bytes.copy_from_slice(&payload);

	Ok(Frame::control(tnc_port, DataKind::RAW, CallField::EMPTY, CallField::EMPTY).with_payload(bytes))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ax25::Path;
	use crate::callsign::CallSign;
	use crate::ax25::Type;

	#[test]
	fn roundtrips_raw_injection() {
		let packet = Packet {
			to: CallSign::parse("APRS").unwrap(),
			from: CallSign::parse("N0CALL-1").unwrap(),
			path: Path::default(),
			ty: Type::UI,
			command: true,
			response: false,
			p: false,
			f: false,
			nr: None,
			ns: None,
			pid: Some(crate::ax25::PID_NO_LAYER3),
			pid_ext: None,
			info: b"CQ CQ CQ".to_vec(),
		};

		let frame = encode_raw_frame(2, &packet).unwrap();
		assert_eq!(frame.data_kind, DataKind::RAW);

		let decoded = decode_raw_payload(&frame.payload).unwrap();
		assert_eq!(decoded.to, packet.to);
		assert_eq!(decoded.info, packet.info);
	}
}
