use std::collections::VecDeque;

use collections::bytes::{Bytes, Slice};

use crate::error::Error;
use crate::frame::{self, CallField, DataKind, Frame, HEADER_LEN};

/// Refuse to allocate a payload larger than this from a single header's
/// length field; a legitimate TNC never sends frames anywhere near this size,
/// so exceeding it means the byte stream's framing has desynchronized.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Header fields copied out of the wire buffer once a full header has
/// arrived, kept alive while the payload is still being reassembled.
struct Pending {
	tnc_port: u8,
	data_kind: DataKind,
	pid: u8,
	call_from: CallField,
	call_to: CallField,
	user: u32,
	payload_len: usize,
}

enum State {
	Header { buf: Vec<u8> },
	Payload { pending: Pending, buf: Vec<u8> },
}

impl State {
	fn header() -> Self {
		State::Header { buf: Vec::with_capacity(HEADER_LEN) }
	}
}

/// Reassembles the byte stream arriving from the TNC's TCP socket into AGWPE
/// frames (spec §4.3). A frame may be split across any number of reads,
/// including mid-header; `feed` accumulates bytes until whole frames become
/// available.
pub struct Receiver {
	state: State,
	backlog: VecDeque<Slice>,
}

impl Receiver {
	pub fn new() -> Self {
		Self { state: State::header(), backlog: VecDeque::new() }
	}

	/// Feed one chunk of bytes received from the socket, returning every
	/// frame that became complete as a result, in arrival order.
	pub fn feed(&mut self, chunk: Slice) -> Result<Vec<Frame>, Error> {
		self.backlog.push_back(chunk);
		let mut frames = Vec::new();

		loop {
			match &mut self.state {
				State::Header { buf } => {
					fill(buf, HEADER_LEN, &mut self.backlog);

					if buf.len() < HEADER_LEN {
						break;
					}

					let mut header_buf = [0u8; HEADER_LEN];
					header_buf.copy_from_slice(buf);
					let header = frame::decode_header(&header_buf);
					let payload_len = header.payload_len.get() as usize;

					if payload_len > MAX_PAYLOAD {
						return Err(Error::MalformedFrame("payload length exceeds sanity limit"));
					}

					let pending = Pending {
						tnc_port: header.tnc_port,
						data_kind: DataKind(header.data_kind),
						pid: header.pid,
						call_from: CallField(header.call_from),
						call_to: CallField(header.call_to),
						user: header.user.get(),
						payload_len,
					};

					self.state = State::Payload { pending, buf: Vec::with_capacity(payload_len) };
				}

				State::Payload { pending, buf } => {
					fill(buf, pending.payload_len, &mut self.backlog);

					if buf.len() < pending.payload_len {
						break;
					}

					let mut payload = Bytes::new(pending.payload_len);
					payload.copy_from_slice(buf);

					frames.push(Frame {
						tnc_port: pending.tnc_port,
						data_kind: pending.data_kind,
						pid: pending.pid,
						call_from: pending.call_from,
						call_to: pending.call_to,
						user: pending.user,
						payload,
					});

					self.state = State::header();
				}
			}
		}

		Ok(frames)
	}
}

impl Default for Receiver {
	fn default() -> Self {
		Self::new()
	}
}

/// Move bytes from `backlog` into `buf` until `buf` reaches `target` bytes or
/// `backlog` is drained, consuming chunks (and partial chunks) as needed.
fn fill(buf: &mut Vec<u8>, target: usize, backlog: &mut VecDeque<Slice>) {
	while buf.len() < target {
		let Some(front) = backlog.front() else { break };

		let need = target - buf.len();
		let take = need.min(front.len());
		buf.extend_from_slice(front.split_bytes(take));

		if front.is_empty() {
			backlog.pop_front();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::callsign::CallSign;

	fn encode_frame(data_kind: DataKind, payload: &[u8]) -> Vec<u8> {
		let call_from = CallField::from_call(CallSign::parse("N0CALL").unwrap());
		let call_to = CallField::from_call(CallSign::parse("W1AW").unwrap());

		let mut bytes = Bytes::new(payload.len());
		bytes.copy_from_slice(payload);

		let frame = Frame::control(0, data_kind, call_from, call_to).with_payload(bytes);

		let mut vec = vec![0u8; frame.encoded_len()];
		collections::bytes::Cursor::vec(&mut vec, |cursor| frame.encode(cursor));
		vec
	}

	fn chunk(bytes: &[u8]) -> Slice {
		let mut slice = Slice::new(bytes.len());
		slice.copy_from_slice(bytes);
		slice
	}

	#[test]
	fn reassembles_a_single_whole_chunk() {
		let wire = encode_frame(DataKind::DATA, b"hello");
		let mut receiver = Receiver::new();

		let frames = receiver.feed(chunk(&wire)).unwrap();
		assert_eq!(frames.len(), 1);
		assert_eq!(&*frames[0].payload, b"hello");
	}

	#[test]
	fn reassembles_byte_at_a_time() {
		let wire = encode_frame(DataKind::DATA, b"hello world");
		let mut receiver = Receiver::new();

		let mut frames = Vec::new();
		for byte in &wire {
			frames.extend(receiver.feed(chunk(&[*byte])).unwrap());
		}

		assert_eq!(frames.len(), 1);
		assert_eq!(&*frames[0].payload, b"hello world");
	}

	#[test]
	fn reassembles_two_frames_in_one_chunk() {
		let mut wire = encode_frame(DataKind::DATA, b"one");
		wire.extend(encode_frame(DataKind::DATA, b"two"));

		let mut receiver = Receiver::new();
		let frames = receiver.feed(chunk(&wire)).unwrap();

		assert_eq!(frames.len(), 2);
		assert_eq!(&*frames[0].payload, b"one");
		assert_eq!(&*frames[1].payload, b"two");
	}

	#[test]
	fn rejects_implausible_payload_length() {
		let mut header = vec![0u8; HEADER_LEN];
		header[28..32].copy_from_slice(&(MAX_PAYLOAD as u32 + 1).to_le_bytes());

		let mut receiver = Receiver::new();
		assert!(receiver.feed(chunk(&header)).is_err());
	}
}
