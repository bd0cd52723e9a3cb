use collections::bytes::Bytes;
use log::warn;
use stakker::{Fwd, FixedTimerKey, CX};

use crate::assembler::{Assembler, COALESCE_TIMEOUT};
use crate::callsign::CallSign;
use crate::conn_router::ConnKey;
use crate::conn_throttle::{ConnThrottle, POLL_INTERVAL};
use crate::frame::{CallField, DataKind, Frame};
use crate::server::Server;

/// `callTo` of the tail identification frame sent on close when this server
/// was constructed with an `id` (spec §4.8/§6): not a real station, just the
/// AGWPE convention for "this UNPROTO frame is a station ID".
const ID_CALL: &str = "ID";

/// The lifecycle of a single AX.25 connected-mode session (spec §4.10).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
	/// A local `createConnection` is outstanding; waiting for the TNC's `'C'` reply.
	Pending,
	/// The session is up; data may flow in either direction.
	Established,
	/// A local close was requested; draining queued data before sending `'d'`.
	Closing,
	/// The session is gone, either by local or remote request.
	Closed,
}

/// One AX.25 connected-mode session (spec §4.10): wraps a [`ConnThrottle`] for
/// outbound flow control and an [`Assembler`] for coalescing application
/// writes into data frames, and owns the timers that drive both.
pub struct Connection {
	pub key: ConnKey,
	pub state: State,
	throttle: ConnThrottle,
	assembler: Assembler,
	poll_timer: FixedTimerKey,
	coalesce_timer: FixedTimerKey,
	/// Whether the application's read side can currently accept another `'D'`
	/// frame (spec §3's "receive-buffer pushable flag"); a `'D'` arriving while
	/// this is `false` is a receive-buffer overflow (spec §4.10).
	pushable: bool,
	/// Delivers inbound application data (`'D'` frames) to the caller.
	read_fwd: Fwd<Bytes>,
	/// Delivers a final notification when the session closes, `true` if the
	/// remote end initiated the close.
	closed_fwd: Fwd<bool>,
	/// Station-identification text sent as a tail `'M'` UNPROTO frame on close,
	/// whether the close was requested locally or the remote end hung up
	/// first (spec §4.8/§6): carried on the connection itself so both
	/// [`close`](Self::close) and [`on_remote_close`](Self::on_remote_close)
	/// can build the tail frame without an outside caller threading it through.
	id: Option<String>,
}

impl Connection {
	pub fn new(key: ConnKey, state: State, frame_length: usize, read_fwd: Fwd<Bytes>, closed_fwd: Fwd<bool>, id: Option<String>) -> Self {
		Self {
			key,
			state,
			throttle: ConnThrottle::new(0, 8),
			assembler: Assembler::new(frame_length),
			poll_timer: FixedTimerKey::default(),
			coalesce_timer: FixedTimerKey::default(),
			pushable: true,
			read_fwd,
			closed_fwd,
			id,
		}
	}

	/// Set by the application to report backpressure (or its release) on the
	/// connection's readable side (spec §3/§4.10).
	pub fn set_pushable(&mut self, pushable: bool) {
		self.pushable = pushable;
	}

	fn to_field(&self) -> CallField {
		CallField::from_call(self.key.remote)
	}

	fn from_field(&self) -> CallField {
		CallField::from_call(self.key.local)
	}

	/// Called when the TNC reports this session established (our own connect
	/// request succeeded, or an incoming connection arrived).
	pub fn mark_established(&mut self) {
		self.state = State::Established;
	}

	/// Queue application bytes for transmission, splitting/coalescing them
	/// into data frames per the assembler's policy (spec §4.9) and handing
	/// each one through the connection throttle (spec §4.8). Returns every
	/// frame the throttle admitted immediately, in order; the caller
	/// (`Server`) is responsible for offering each in turn to the port's
	/// throttle below this one (spec §2's egress pipeline) — this connection
	/// has no reference to the port router it lives under.
	pub fn write(&mut self, cx: CX![Server], data: &[u8]) -> Vec<Frame> {
		let mut ready = Vec::new();

		for chunk in self.assembler.push(data) {
			ready.extend(self.offer_data(chunk));
		}

		if self.assembler.has_pending() {
			self.arm_coalesce_timer(cx);
		}

		self.arm_poll_timer(cx);

		ready
	}

	fn offer_data(&mut self, payload: Vec<u8>) -> Option<Frame> {
		let mut bytes = Bytes::new(payload.len());
		bytes.copy_from_slice(&payload);

		let frame = Frame::control(self.key.port, DataKind::DATA, self.from_field(), self.to_field()).with_payload(bytes);

		self.throttle.offer(frame)
	}

	/// Called when the connection's coalescing timer fires: flush whatever is
	/// buffered regardless of size.
	pub fn flush_coalesce(&mut self) -> Option<Frame> {
		self.assembler.take_ready().and_then(|chunk| self.offer_data(chunk))
	}

	/// Whether the connection throttle wants a look-ahead `'Y'` query sent
	/// right now (spec §4.7), rather than waiting for the 2s poll timer.
	pub fn wants_lookahead_query(&self) -> bool {
		self.throttle.wants_lookahead_query()
	}

	/// Called on a `'D'` frame addressed to this connection. Both of these are
	/// protocol errors (spec §4.10, §7): data after the application closed its
	/// write side, and data arriving while the read side is still signalling
	/// backpressure from a previous frame. Neither has a natural path back to
	/// the application through the plain `Fwd<Bytes>` this carries data on, so
	/// — consistent with this crate's logged-and-continue handling of other
	/// internal protocol faults — they are logged rather than silently
	/// dropped.
	pub fn on_data(&mut self, payload: &[u8]) {
		if self.state == State::Closed {
			warn!("Received 'D' frame for {:?} after local close", self.key);
			return;
		}

		if !self.pushable {
			warn!("Receive buffer overflow on {:?}: 'D' frame arrived while backpressured", self.key);
			return;
		}

		let mut bytes = Bytes::new(payload.len());
		bytes.copy_from_slice(payload);
		self.read_fwd.fwd(bytes);
	}

	/// Called on a `'Y'` reply reporting this connection's in-flight count.
	/// Returns every frame now released, in order: queued data first, then —
	/// once the queue and in-flight counter both reach zero — the final
	/// frames from a pending close.
	pub fn on_frames_outstanding(&mut self, inflight: u32) -> Vec<Frame> {
		self.throttle.on_query_reply(inflight);

		let mut ready = Vec::new();

		while self.throttle.should_drain() {
			let Some(frame) = self.throttle.drain_one() else { break };
			ready.push(frame);
		}

		ready.extend(self.drain_final_frames());

		ready
	}

	/// Release every final frame that is now safe to send, in order: the
	/// `'d'` disconnect, then — if configured — the tail `'M'` ID frame (spec
	/// §4.8). Neither is data-bearing, so once the drain gate opens both go
	/// out on the same tick without re-blocking each other.
	fn drain_final_frames(&mut self) -> Vec<Frame> {
		let mut ready = Vec::new();

		while let Some(frame) = self.throttle.take_final_frame() {
			ready.push(frame);
			self.state = State::Closed;
		}

		ready
	}

	/// Request a local close: drain queued/in-flight data, then send `'d'`
	/// and, if this connection carries a configured ID, a trailing UNPROTO
	/// identification frame (spec §4.8/§6). Returns whatever final frames are
	/// immediately safe to send.
	pub fn close(&mut self, cx: CX![Server]) -> Vec<Frame> {
		self.state = State::Closing;

		let disconnect = Frame::control(self.key.port, DataKind::DISCONNECT, self.from_field(), self.to_field());
		let mut finals = vec![disconnect];

		if let Some(id) = self.id.clone() {
			finals.push(self.id_frame(&id));
		}

		self.throttle.request_close(finals);
		let ready = self.drain_final_frames();

		if !matches!(self.state, State::Closed) {
			self.arm_poll_timer(cx);
		}

		ready
	}

	/// Build the tail `'M'` UNPROTO identification frame (spec §4.8/§9):
	/// `callTo` is the literal text `"ID"`, and the payload is `id` encoded as
	/// ISO-8859-1 (spec §9's frozen character-encoding rule), not UTF-8 —
	/// every code point up to U+00FF maps to its single-byte Latin-1 value.
	fn id_frame(&self, id: &str) -> Frame {
		let latin1: Vec<u8> = id.chars().map(|c| u8::try_from(c as u32).unwrap_or(b'?')).collect();

		let mut payload = Bytes::new(latin1.len());
		payload.copy_from_slice(&latin1);

		let call_to = CallField::from_call(CallSign::parse(ID_CALL).expect("\"ID\" is a valid call sign field"));

		Frame::control(self.key.port, DataKind::UNPROTO, self.from_field(), call_to).with_payload(payload)
	}

	/// Called on a `'d'` frame: the remote end (or the TNC itself) closed the
	/// link. Spec §4.8's inbound-`'d'` handling belongs to the connection
	/// throttle, not the connection directly: any frames still queued can
	/// never reach a link that's already gone and are purged, and the tail
	/// `'M'` ID frame, if configured, is appended as the only remaining final
	/// frame before the connection is torn down. Returns whatever final
	/// frames are now ready to send (the caller is responsible for offering
	/// them to the port throttle below this one).
	pub fn on_remote_close(&mut self) -> Vec<Frame> {
		let id_frame = self.id.clone().map(|id| self.id_frame(&id));
		self.throttle.on_remote_disconnect(id_frame);

		let mut ready = Vec::new();
		while let Some(frame) = self.throttle.take_final_frame() {
			ready.push(frame);
		}

		self.state = State::Closed;
		self.closed_fwd.fwd(true);
		ready
	}

	pub fn is_closed(&self) -> bool {
		self.state == State::Closed
	}

	pub(crate) fn arm_poll_timer(&mut self, cx: CX![Server]) {
		if self.poll_timer != FixedTimerKey::default() {
			return;
		}

		let actor = cx.access_actor().clone();
		let key = self.key;

		self.poll_timer = cx.after(POLL_INTERVAL, move |s| actor.apply(s, move |this: &mut Server, cx| this.on_conn_poll_tick(cx, key)));
	}

	fn arm_coalesce_timer(&mut self, cx: CX![Server]) {
		if self.coalesce_timer != FixedTimerKey::default() {
			return;
		}

		let actor = cx.access_actor().clone();
		let key = self.key;

		self.coalesce_timer = cx.after(COALESCE_TIMEOUT, move |s| actor.apply(s, move |this: &mut Server, cx| this.on_conn_coalesce_tick(cx, key)));
	}

	/// Called by [`Server::on_conn_poll_tick`] once the timer fires: clears
	/// the timer key and reports whether another `'Y'` query should be sent.
	pub fn poll_tick(&mut self) -> bool {
		self.poll_timer = FixedTimerKey::default();
		!matches!(self.state, State::Closed)
	}

	/// Called by [`Server::on_conn_coalesce_tick`] once the timer fires.
	pub fn coalesce_tick(&mut self) {
		self.coalesce_timer = FixedTimerKey::default();
	}

	pub fn query_frame(&self) -> Frame {
		Frame::control(self.key.port, DataKind::CONN_FRAMES, self.from_field(), self.to_field())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::callsign::CallSign;

	fn key() -> ConnKey {
		ConnKey { port: 0, local: CallSign::parse("N0CALL").unwrap(), remote: CallSign::parse("N1CALL-1").unwrap() }
	}

	fn conn(state: State) -> Connection {
		Connection::new(key(), state, 128, Fwd::new(|_| {}), Fwd::new(|_| {}), None)
	}

	fn conn_with_id(state: State, id: &str) -> Connection {
		Connection::new(key(), state, 128, Fwd::new(|_| {}), Fwd::new(|_| {}), Some(id.to_string()))
	}

	#[test]
	fn offer_data_returns_frame_immediately_when_throttle_open() {
		// ConnThrottle seeds inflight at 1 (Direwolf quirk) with high=8, so the
		// first data frame is admitted without waiting for a 'Y' reply.
		let mut c = conn(State::Established);

		let frame = c.offer_data(b"hello".to_vec());
		assert!(frame.is_some());
		assert_eq!(frame.unwrap().data_kind, DataKind::DATA);
	}

	#[test]
	fn wants_lookahead_query_reflects_throttle_state() {
		let mut c = conn(State::Established);
		assert!(!c.wants_lookahead_query());

		// Drive inflight to exactly half of the throttle's high watermark (8/2 = 4).
		c.on_frames_outstanding(4);
		assert!(c.wants_lookahead_query());
	}

	#[test]
	fn close_with_no_pending_data_releases_final_frames_immediately() {
		let mut c = conn(State::Established);
		c.on_frames_outstanding(0);

		let disconnect = Frame::control(c.key.port, DataKind::DISCONNECT, c.from_field(), c.to_field());
		let id = c.id_frame("MYID");
		c.throttle.request_close([disconnect, id]);
		let ready = c.drain_final_frames();

		let kinds: Vec<_> = ready.iter().map(|f| f.data_kind).collect();
		assert_eq!(kinds, vec![DataKind::DISCONNECT, DataKind::UNPROTO]);
		assert!(c.is_closed());
	}

	#[test]
	fn on_data_after_close_is_dropped_not_delivered() {
		let mut c = conn(State::Closed);
		// Should log and return rather than forwarding to the (never-polled) Fwd.
		c.on_data(b"late");
	}

	#[test]
	fn on_data_while_not_pushable_is_dropped() {
		let mut c = conn(State::Established);
		c.set_pushable(false);
		c.on_data(b"overflow");
	}

	/// Spec §4.8: an inbound `'d'` purges anything still queued (it can never
	/// reach a link that's already gone) and releases the tail ID frame
	/// immediately rather than waiting on a drain that would never complete.
	#[test]
	fn on_remote_close_purges_queue_and_releases_tail_id_frame() {
		let mut c = conn_with_id(State::Established, "MYID");

		// Queue the connection up well past its high watermark so frames are
		// still sitting in the throttle's buffer when the remote hangs up.
		for _ in 0..20 {
			c.offer_data(b"queued".to_vec());
		}
		assert!(c.throttle.has_pending());

		let ready = c.on_remote_close();

		assert_eq!(ready.len(), 1);
		assert_eq!(ready[0].data_kind, DataKind::UNPROTO);
		assert_eq!(&ready[0].payload[..], b"MYID");
		assert!(!c.throttle.has_pending(), "queued 'D' frames must be purged, not sent after disconnect");
		assert!(c.is_closed());
	}

	#[test]
	fn on_remote_close_without_id_releases_nothing() {
		let mut c = conn(State::Established);
		let ready = c.on_remote_close();
		assert!(ready.is_empty());
		assert!(c.is_closed());
	}
}
