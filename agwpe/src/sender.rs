use std::net::TcpStream;

use runtime::Io;
use utils::error::Result;

use crate::frame::Frame;

/// Encodes object-form frames directly onto the TNC's TCP socket (spec §4.4).
/// Backpressure (a full kernel send buffer) is handled transparently by
/// [`Io`]: the frame's bytes are queued and retried once the socket becomes
/// writable again, so callers never need to know the difference between an
/// immediate send and a queued one.
pub struct Sender {
	io: Io<TcpStream>,
}

impl Sender {
	pub fn new(io: Io<TcpStream>) -> Self {
		Self { io }
	}

	/// Encode and send `frame`. Only fails if the underlying socket has
	/// failed; the error has already been logged by [`Io::write_sized`].
	pub fn send(&self, frame: &Frame) -> Result<()> {
		self.io.write_sized(frame.encoded_len(), |cursor| frame.encode(cursor))
	}
}
