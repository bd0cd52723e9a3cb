use std::collections::VecDeque;

/// The flow-control engine shared by the port throttle and the connection
/// throttle (spec §4.7). Both wrap this with their own `'y'`/`'Y'` in-flight
/// query framing and their own timer; this module holds only the bookkeeping
/// that is identical between them: a FIFO of held-back work, an in-flight
/// counter, and the low/high watermark hysteresis that lets a connection
/// drain to zero before the final disconnect frames go out.
pub struct Throttle<T> {
	/// Frames (or deferred closures) held back while inflight is at or above `max`.
	queue: VecDeque<T>,
	/// The TNC's most recently reported in-flight frame count for this port/connection.
	inflight: u32,
	/// Resume releasing queued work once `inflight` falls to or below this.
	low: u32,
	/// Stop releasing queued work once `inflight` reaches this.
	high: u32,
	/// Set once the owner has asked to disconnect; once the queue drains with
	/// this set, the owner's final frames (DISC/`d`) may go out.
	closing: bool,
}

impl<T> Throttle<T> {
	pub fn new(low: u32, high: u32) -> Self {
		assert!(low <= high, "low watermark must not exceed high watermark");

		Self { queue: VecDeque::new(), inflight: 0, low, high, closing: false }
	}

	/// Record the TNC's answer to a `'y'`/`'Y'` in-flight query.
	pub fn set_inflight(&mut self, inflight: u32) {
		self.inflight = inflight;
	}

	/// Whether new work may be sent immediately rather than queued.
	pub fn is_open(&self) -> bool {
		self.inflight < self.high
	}

	/// Whether the throttle has drained enough to resume releasing queued work.
	pub fn should_resume(&self) -> bool {
		self.inflight <= self.low
	}

	pub fn is_queue_empty(&self) -> bool {
		self.queue.is_empty()
	}

	pub fn queue_len(&self) -> usize {
		self.queue.len()
	}

	/// Hold an item back until the throttle reopens.
	pub fn enqueue(&mut self, item: T) {
		self.queue.push_back(item);
	}

	/// Record that a data-bearing item was just handed off for sending — either
	/// immediately (`offer`'s fast path) or released from the queue
	/// (`dequeue`). Spec §4.7's try-drain loop increments `inFlight` locally
	/// right after each data-bearing send rather than waiting for the next
	/// `'y'`/`'Y'` reply; without this, a burst of writes between two replies
	/// would all see a stale (too-low) `inflight` and blow straight past
	/// `high`. The next reply still overwrites this with the TNC's own count.
	pub fn note_dispatch(&mut self, data_bearing: bool) {
		if data_bearing {
			self.inflight = self.inflight.saturating_add(1);
		}
	}

	/// Spec §4.7's look-ahead: once a dispatch brings `inflight` to half of
	/// `high`, query now instead of waiting for the poll timer, so the real
	/// count is known well before the throttle actually closes.
	pub fn wants_lookahead_query(&self) -> bool {
		self.high > 0 && self.inflight == self.high / 2
	}

	/// Pull the next queued item, if any. The caller is responsible for
	/// deciding, via [`is_open`](Self::is_open)/[`should_resume`](Self::should_resume),
	/// whether now is a good time to call this.
	pub fn dequeue(&mut self) -> Option<T> {
		self.queue.pop_front()
	}

	/// Mark that the owner wants to close once the queue drains.
	pub fn begin_close(&mut self) {
		self.closing = true;
	}

	/// Drop every item still queued. Used when the link has already torn down
	/// before the normal drain could release them (spec §4.8's inbound `'d'`
	/// path): those frames can never be sent, so they are discarded rather
	/// than held against a drain gate that would otherwise never open.
	pub fn clear_queue(&mut self) {
		self.queue.clear();
	}

	pub fn is_closing(&self) -> bool {
		self.closing
	}

	/// True once a close was requested and no work remains queued or in flight.
	pub fn is_drained(&self) -> bool {
		self.closing && self.queue.is_empty() && self.inflight == 0
	}
}
