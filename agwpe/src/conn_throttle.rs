use std::collections::VecDeque;
use std::time::Duration;

use crate::frame::Frame;
use crate::throttle::Throttle;

/// How often a `'Y'` in-flight query is sent for a connection while frames
/// are queued against it (spec §4.7/§4.8).
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Direwolf reports `Y=1` for a brand-new connection before the link is
/// actually carrying anything (spec §9); assuming that value up front avoids
/// treating the connection as already drained before its first real `'Y'`
/// reply arrives.
const DIREWOLF_INITIAL_INFLIGHT: u32 = 1;

/// Per-connection flow control (spec §4.8), built on the same engine as
/// [`PortThrottle`](crate::port_throttle::PortThrottle) but additionally
/// holding back a connection's final frames — the `'d'` disconnect and an
/// optional tail `'M'` identification frame — until every queued and
/// in-flight data frame has actually left: disconnecting while frames are
/// still outstanding would let the TNC discard unsent data (spec §4.8's
/// final-frames protocol, testable property 5).
pub struct ConnThrottle {
	engine: Throttle<Frame>,
	final_frames: VecDeque<Frame>,
}

impl ConnThrottle {
	pub fn new(low: u32, high: u32) -> Self {
		let mut engine = Throttle::new(low, high);
		engine.set_inflight(DIREWOLF_INITIAL_INFLIGHT);

		Self { engine, final_frames: VecDeque::new() }
	}

	pub fn on_query_reply(&mut self, inflight: u32) {
		self.engine.set_inflight(inflight);
	}

	pub fn offer(&mut self, frame: Frame) -> Option<Frame> {
		if self.engine.is_closing() {
			// No new data is accepted once the connection is closing.
			return None;
		}

		if self.engine.is_open() && self.engine.is_queue_empty() {
			self.engine.note_dispatch(frame.data_kind.is_data_bearing());
			return Some(frame);
		}

		self.engine.enqueue(frame);
		None
	}

	pub fn should_drain(&self) -> bool {
		!self.engine.is_queue_empty() && self.engine.should_resume()
	}

	pub fn drain_one(&mut self) -> Option<Frame> {
		let frame = self.engine.dequeue()?;
		self.engine.note_dispatch(frame.data_kind.is_data_bearing());
		Some(frame)
	}

	/// Spec §4.7's look-ahead: query now rather than waiting for the poll timer.
	pub fn wants_lookahead_query(&self) -> bool {
		self.engine.wants_lookahead_query()
	}

	pub fn has_pending(&self) -> bool {
		!self.engine.is_queue_empty()
	}

	/// Record that the connection wants to close, holding `frames` (the `'d'`
	/// disconnect, and — if this server has a configured ID — a trailing `'M'`
	/// UNPROTO identification frame) until the queue and in-flight counter
	/// both drain to zero. `frames` must be given in the order they are to be
	/// sent.
	pub fn request_close(&mut self, frames: impl IntoIterator<Item = Frame>) {
		self.engine.begin_close();
		self.final_frames.extend(frames);
	}

	/// Returns the next final frame once it is safe to send (queue and
	/// in-flight both drained), consuming it so each is only ever returned
	/// once. Callers should keep calling this until it returns `None`: once
	/// drained, every remaining final frame (e.g. the tail ID frame after
	/// `'d'`) is released in order on the same tick, since none of them are
	/// themselves data-bearing and so never re-block the drain gate.
	pub fn take_final_frame(&mut self) -> Option<Frame> {
		if self.engine.is_drained() {
			self.final_frames.pop_front()
		} else {
			None
		}
	}

	pub fn has_final_frames(&self) -> bool {
		!self.final_frames.is_empty()
	}

	pub fn is_closing(&self) -> bool {
		self.engine.is_closing()
	}

	/// Handle an inbound `'d'` (spec §4.8): the link is already gone by the
	/// time this arrives, so anything still queued can never be sent and is
	/// purged rather than held against a drain gate the TNC will never
	/// complete. `id_frame`, if given, becomes the only remaining final frame
	/// and is available from [`take_final_frame`](Self::take_final_frame) on
	/// the very next call, since there is no more in-flight data to wait on.
	pub fn on_remote_disconnect(&mut self, id_frame: Option<Frame>) {
		self.engine.clear_queue();
		self.engine.set_inflight(0);
		self.engine.begin_close();
		self.final_frames.clear();
		self.final_frames.extend(id_frame);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::callsign::CallSign;
	use crate::frame::{CallField, DataKind};

	fn frame(kind: DataKind) -> Frame {
		let call = CallField::from_call(CallSign::parse("N0CALL").unwrap());
		Frame::control(0, kind, call, call)
	}

	#[test]
	fn holds_final_frame_until_drained() {
		let mut t = ConnThrottle::new(0, 2);
		t.on_query_reply(2);
		assert!(t.offer(frame(DataKind::DATA)).is_none());

		t.request_close([frame(DataKind::DISCONNECT)]);
		assert!(t.take_final_frame().is_none());

		t.drain_one();
		t.on_query_reply(0);
		assert!(t.take_final_frame().is_some());
		assert!(t.take_final_frame().is_none());
	}

	#[test]
	fn releases_tail_id_frame_right_after_disconnect() {
		let mut t = ConnThrottle::new(0, 2);
		t.on_query_reply(0);

		t.request_close([frame(DataKind::DISCONNECT), frame(DataKind::UNPROTO)]);

		assert_eq!(t.take_final_frame().map(|f| f.data_kind), Some(DataKind::DISCONNECT));
		assert_eq!(t.take_final_frame().map(|f| f.data_kind), Some(DataKind::UNPROTO));
		assert!(t.take_final_frame().is_none());
	}

	#[test]
	fn rejects_new_data_once_closing() {
		let mut t = ConnThrottle::new(0, 2);
		t.request_close([frame(DataKind::DISCONNECT)]);
		assert!(t.offer(frame(DataKind::DATA)).is_none());
		assert!(!t.has_pending());
	}

	#[test]
	fn on_remote_disconnect_purges_queue_and_frees_id_frame_immediately() {
		let mut t = ConnThrottle::new(0, 2);
		t.on_query_reply(2);
		assert!(t.offer(frame(DataKind::DATA)).is_none());
		assert!(t.has_pending());

		t.on_remote_disconnect(Some(frame(DataKind::UNPROTO)));

		assert!(!t.has_pending(), "frames queued before the remote hung up must be purged");
		assert_eq!(t.take_final_frame().map(|f| f.data_kind), Some(DataKind::UNPROTO));
		assert!(t.take_final_frame().is_none());
	}

	#[test]
	fn on_remote_disconnect_without_id_frame_has_nothing_to_release() {
		let mut t = ConnThrottle::new(0, 2);
		t.on_remote_disconnect(None);
		assert!(t.take_final_frame().is_none());
	}
}
