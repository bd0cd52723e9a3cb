use std::collections::HashMap;

use stakker::Fwd;
use utils::error::Result;

use crate::callsign::CallSign;
use crate::connection::{Connection, State};
use crate::error::Error;
use crate::frame::Frame;
use crate::server::Server;

/// Identifies one AX.25 connected-mode session by the TNC port and the two
/// stations on the link (spec §4.6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnKey {
	pub port: u8,
	pub local: CallSign,
	pub remote: CallSign,
}

/// Owns every live [`Connection`], dispatching incoming `'C'`/`'D'`/`'d'`/`'Y'`
/// frames to the right one by [`ConnKey`] (spec §4.6).
#[derive(Default)]
pub struct ConnRouter {
	conns: HashMap<ConnKey, Connection>,
}

impl ConnRouter {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get_mut(&mut self, key: &ConnKey) -> Option<&mut Connection> {
		self.conns.get_mut(key)
	}

	pub fn contains(&self, key: &ConnKey) -> bool {
		self.conns.contains_key(key)
	}

	/// Create (and track) a connection object. `key.local`/`key.remote` are
	/// taken from the `'C'` frame's callFrom/callTo fields respectively.
	/// `frame_length` is this server's configured maximum `'D'` payload size
	/// (spec §4.9/§6), applied to the new connection's assembler. `id` is this
	/// server's configured station-identification text (spec §4.8/§6),
	/// carried by the connection itself so either a local or a remote-
	/// initiated close can build the tail ID frame.
	pub fn create(&mut self, key: ConnKey, state: State, frame_length: usize, read_fwd: Fwd<collections::bytes::Bytes>, closed_fwd: Fwd<bool>, id: Option<String>) -> Result<(), Error> {
		if self.conns.contains_key(&key) {
			return Err(Error::AddrInUse { port: key.port, local: key.local, remote: key.remote });
		}

		self.conns.insert(key, Connection::new(key, state, frame_length, read_fwd, closed_fwd, id));
		Ok(())
	}

	/// Route an inbound `'D'` data frame.
	pub fn on_data(&mut self, key: &ConnKey, payload: &[u8]) {
		if let Some(conn) = self.conns.get_mut(key) {
			conn.on_data(payload);
		}
	}

	/// Route an inbound `'Y'` in-flight reply. Returns the frames the
	/// connection's throttle released, for the caller to offer to the port
	/// throttle below it.
	pub fn on_frames_outstanding(&mut self, key: &ConnKey, inflight: u32) -> Vec<Frame> {
		let Some(conn) = self.conns.get_mut(key) else { return Vec::new() };

		let ready = conn.on_frames_outstanding(inflight);

		if conn.is_closed() {
			self.conns.remove(key);
		}

		ready
	}

	/// Route an inbound `'d'` disconnect. Returns whatever final frames the
	/// connection's throttle released (spec §4.8: a purge of queued data plus
	/// an optional tail ID frame), for the caller to offer to the port
	/// throttle below it; the connection record itself is always removed
	/// (the deferred self-destroy spec §4.8 describes is immediate here,
	/// since those final frames are computed synchronously).
	pub fn on_remote_close(&mut self, key: &ConnKey) -> Vec<Frame> {
		let Some(mut conn) = self.conns.remove(key) else { return Vec::new() };
		conn.on_remote_close()
	}

	pub fn mark_established(&mut self, key: &ConnKey) {
		if let Some(conn) = self.conns.get_mut(key) {
			conn.mark_established();
		}
	}

	/// Remove a connection that has fully closed locally (queue drained, final
	/// frame sent synchronously rather than via a later `'Y'` reply).
	pub fn reap_if_closed(&mut self, key: &ConnKey) {
		if self.conns.get(key).is_some_and(Connection::is_closed) {
			self.conns.remove(key);
		}
	}

	pub fn keys(&self) -> impl Iterator<Item = &ConnKey> {
		self.conns.keys()
	}
}
