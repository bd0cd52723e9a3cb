#![allow(clippy::too_many_arguments)]

use core::net::SocketAddr;
use std::collections::{HashSet, VecDeque};
use std::net::TcpStream;

use collections::bytes::{Bytes, Slice};
use log::{error, warn};
use stakker::{fwd_to, Fwd, FixedTimerKey, Ret, CX};
use utils::error::*;

use crate::ax25::{self, Path};
use crate::callsign::CallSign;
use crate::conn_router::{ConnKey, ConnRouter};
use crate::connection::State;
use crate::error::{Error, RegistrationResult};
use crate::frame::{CallField, DataKind, Frame};
use crate::port_router::{PortCaps, PortRouter};
use crate::raw::{self, MonitorEvent};
use crate::receiver::Receiver;
use crate::sender::Sender;

/// How often a `'y'`/`'Y'` in-flight query is sent while frames are queued (spec §4.7).
pub use crate::port_throttle::POLL_INTERVAL;

/// Construction-time options beyond the TCP endpoint (spec §6). `host`/`port`
/// are the `addr` passed to [`Server::init`] directly, matching
/// `Wireguard::init`'s plain-argument constructor; these are the remaining
/// per-server knobs.
pub struct Config {
	/// Maximum payload bytes of a single `'D'` frame (spec §4.9/§6). Default 128;
	/// oversize values are accepted as given, since the cutoff beyond which a
	/// real TNC tears down the TCP connection is TNC-specific and not this
	/// library's business to enforce.
	pub frame_length: usize,
	/// Station-identification text sent as a tail `'M'` UNPROTO frame when each
	/// connection closes (spec §4.8/§6), if set.
	pub id: Option<String>,
	/// The Direwolf port-count-doubling compatibility quirk (spec §9): some
	/// TNC variants expect a requested port index to be checked against
	/// `2 * N` rather than `N` advertised ports. Off by default.
	pub port_count_x2: bool,
}

impl Default for Config {
	fn default() -> Self {
		Self { frame_length: crate::assembler::DEFAULT_FRAME_LENGTH, id: None, port_count_x2: false }
	}
}

/// The top-level AGWPE client (spec §4.11): owns the single TCP connection to
/// the TNC, reassembles frames, and dispatches each one to the port or
/// connection router by dataKind.
pub struct Server {
	sender: Sender,
	receiver: Receiver,
	port_router: PortRouter,
	conn_router: ConnRouter,
	config: Config,

	/// Notifies the application of a newly-established inbound connection.
	incoming_fwd: Fwd<ConnKey>,
	/// Notifies the application of raw-mode packets and monitor-mode lines.
	monitor_fwd: Fwd<MonitorEvent>,

	/// One outstanding `'X'` registration request, if any (spec §9: this
	/// implementation assumes registrations are not pipelined, matching the
	/// blocking request/reply style of the reference client this is
	/// grounded on). Further `register_then` calls queue in `register_queue`
	/// until this one's reply arrives.
	pending_register: Option<PendingRegister>,
	/// `(port, callSign)` pairs the TNC has already accepted an `'X'` for
	/// (spec §4.11: `listen()`/`connect()` only register a call sign "if not
	/// already registered").
	registered: HashSet<(u8, CallSign)>,
	/// Registration requests waiting for `pending_register` to free up.
	register_queue: VecDeque<(u8, CallSign, Box<dyn FnOnce(&mut Server, RegistrationResult)>)>,
	/// Waiters on the TNC's port list (spec §4.11): the public `list_ports()`
	/// caller, a pending `listen()` orchestration, or both, all released
	/// together once a `'G'` reply arrives.
	pending_port_list: Vec<PortListWaiter>,
	/// One outstanding `'R'` version-query request, if any.
	pending_version: Option<Ret<(u16, u16)>>,
	/// Templates for ports/local call signs the application has `listen`ed
	/// on, used to construct a [`Connection`](crate::connection::Connection)
	/// when a matching `'C'` frame arrives unprompted.
	listeners: std::collections::HashMap<(u8, CallSign), (Fwd<Bytes>, Fwd<bool>)>,
	/// One poll timer per port currently blocked behind its [`PortThrottle`](crate::port_throttle::PortThrottle)
	/// (spec §4.7): re-queries `'y'` every [`POLL_INTERVAL`] until the port drains.
	port_poll_timers: std::collections::HashMap<u8, FixedTimerKey>,
}

/// A `'X'` registration request still waiting on the TNC's reply, and what to
/// do once the answer arrives (spec §4.11/§4.6: `listen()`/`connect()` both
/// register a call sign before doing anything else, then resume).
struct PendingRegister {
	port: u8,
	call: CallSign,
	then: Box<dyn FnOnce(&mut Server, RegistrationResult)>,
}

/// A `listen()` call waiting on the TNC's port list (spec §4.11) before it
/// can register its call sign and start accepting connections.
struct PendingListen {
	port: u8,
	local: CallSign,
	read_fwd: Fwd<Bytes>,
	closed_fwd: Fwd<bool>,
	ret: Ret<Result<(), Error>>,
}

/// One waiter on the outstanding `'G'` port-list request (spec §4.11): either
/// a direct `list_ports()` caller, or a `listen()` call resuming once the
/// port list (and its non-empty gate) is resolved.
enum PortListWaiter {
	Report(Ret<Result<Vec<(u8, String)>, Error>>),
	Listen(PendingListen),
}

impl Server {
	pub fn init(cx: CX![], addr: SocketAddr, config: Config, incoming_fwd: Fwd<ConnKey>, monitor_fwd: Fwd<MonitorEvent>) -> Option<Self> {
		let socket: std::io::Result<TcpStream> = try {
			let socket = TcpStream::connect(addr)?;
			socket.set_nonblocking(true)?;
			socket
		};

		let socket = socket.ok_or(|err| error!("Failed to connect to TNC at {addr}: {err}"))?;

		let read_fwd = fwd_to!([cx], on_bytes() as (Slice));
		let io = runtime::Io::new(socket, read_fwd);

		Some(Self {
			sender: Sender::new(io),
			receiver: Receiver::new(),
			port_router: PortRouter::new(),
			conn_router: ConnRouter::new(),
			config,
			incoming_fwd,
			monitor_fwd,
			pending_register: None,
			registered: HashSet::new(),
			register_queue: VecDeque::new(),
			pending_port_list: Vec::new(),
			pending_version: None,
			listeners: std::collections::HashMap::new(),
			port_poll_timers: std::collections::HashMap::new(),
		})
	}

	/// Whether the Direwolf port-count-doubling compatibility quirk (spec §9)
	/// is enabled for this server.
	pub fn port_count_x2(&self) -> bool {
		self.config.port_count_x2
	}

	/// Called by the runtime as bytes arrive on the TNC socket.
	fn on_bytes(&mut self, cx: CX![], chunk: Slice) {
		let frames = match self.receiver.feed(chunk) {
			Ok(frames) => frames,
			Err(err) => {
				error!("AGWPE framing lost: {err}");
				return;
			}
		};

		for frame in frames {
			if let Err(err) = self.dispatch(cx, frame) {
				warn!("Error handling AGWPE frame: {err}");
			}
		}
	}

	fn dispatch(&mut self, cx: CX![], frame: Frame) -> Result<(), Error> {
		match frame.data_kind {
			DataKind::PORT_INFO => self.on_port_info(frame),
			DataKind::PORT_CAPS => self.on_port_caps(frame),
			DataKind::REGISTER => self.on_register(frame),
			DataKind::VERSION => self.on_version(frame),
			DataKind::HEARD => self.on_heard(frame),
			DataKind::CONNECT | DataKind::CONNECT_VIA => self.on_connect(frame),
			DataKind::DATA => self.on_data(frame),
			DataKind::DISCONNECT => self.on_disconnect(cx, frame),
			DataKind::PORT_FRAMES => self.on_port_frames(cx, frame),
			DataKind::CONN_FRAMES => self.on_conn_frames(cx, frame),
			DataKind::RAW => self.on_raw(frame),
			DataKind::MONITOR_CONNECTED | DataKind::MONITOR_SUPERVISORY | DataKind::MONITOR_UNPROTO | DataKind::MONITOR_SENT => self.on_monitor(frame),
			_ => {
				warn!("Unhandled AGWPE dataKind {:?}", frame.data_kind);
				Ok(())
			}
		}
	}

	fn on_port_info(&mut self, frame: Frame) -> Result<(), Error> {
		match self.port_router.on_port_info(&frame.payload) {
			Ok(()) => {
				let listing: Vec<(u8, String)> = self.port_router.ports().filter_map(|p| Some((p, self.port_router.description(p)?.to_string()))).collect();

				for waiter in std::mem::take(&mut self.pending_port_list) {
					match waiter {
						PortListWaiter::Report(ret) => ret.ret(Ok(listing.clone())),
						PortListWaiter::Listen(pending) => self.listen_with_ports_known(pending),
					}
				}

				Ok(())
			}
			Err(err) => {
				// `Error` isn't `Clone` (it wraps `std::io::Error` elsewhere), but
				// `on_port_info` only ever returns these two plain-data variants,
				// so reconstruct the same error per waiter rather than losing it
				// to a generic substitute (spec §7's ENOENT contract depends on it).
				let reconstruct = |err: &Error| match err {
					Error::NoPorts => Error::NoPorts,
					Error::MalformedFrame(msg) => Error::MalformedFrame(msg),
					_ => Error::MalformedFrame("'G' reply was malformed"),
				};

				for waiter in std::mem::take(&mut self.pending_port_list) {
					match waiter {
						PortListWaiter::Report(ret) => ret.ret(Err(reconstruct(&err))),
						PortListWaiter::Listen(pending) => pending.ret.ret(Err(reconstruct(&err))),
					}
				}

				Err(err)
			}
		}
	}

	fn on_port_caps(&mut self, frame: Frame) -> Result<(), Error> {
		self.port_router.on_port_caps(frame.tnc_port, &frame.payload)
	}

	fn on_register(&mut self, frame: Frame) -> Result<(), Error> {
		let accepted = frame.payload.first().copied() == Some(1);

		if let Some(pending) = self.pending_register.take() {
			if accepted {
				self.registered.insert((pending.port, pending.call));
			}

			let result = if accepted { RegistrationResult::Ok(pending.call) } else { RegistrationResult::Failed(pending.call) };
			(pending.then)(self, result);
		}

		self.advance_register_queue();
		Ok(())
	}

	fn on_version(&mut self, frame: Frame) -> Result<(), Error> {
		if frame.payload.len() < 6 {
			return Err(Error::MalformedFrame("'R' reply shorter than expected"));
		}

		let major = u16::from_le_bytes(frame.payload[0..2].try_into().expect("checked length"));
		let minor = u16::from_le_bytes(frame.payload[4..6].try_into().expect("checked length"));

		if let Some(ret) = self.pending_version.take() {
			ret.ret((major, minor));
		}

		Ok(())
	}

	fn on_heard(&mut self, frame: Frame) -> Result<(), Error> {
		let text = core::str::from_utf8(&frame.payload).map_err(|_| Error::MalformedFrame("'H' reply is not valid UTF-8"))?;
		self.monitor_fwd.fwd(MonitorEvent::Monitor { port: frame.tnc_port, kind: DataKind::HEARD, text: text.as_bytes().to_vec() });
		Ok(())
	}

	fn on_connect(&mut self, frame: Frame) -> Result<(), Error> {
		let Some(local) = frame.call_from.as_call()? else { return Err(Error::MalformedFrame("'C' frame missing callFrom")) };
		let Some(remote) = frame.call_to.as_call()? else { return Err(Error::MalformedFrame("'C' frame missing callTo")) };

		self.note_port_seen(frame.tnc_port);
		let key = ConnKey { port: frame.tnc_port, local, remote };

		if self.conn_router.contains(&key) {
			self.conn_router.mark_established(&key);
			return Ok(());
		}

		let Some((read_fwd, closed_fwd)) = self.listeners.get(&(key.port, key.local)).cloned() else {
			warn!("Incoming connection on ({}, {local}, {remote}) with no listener registered", key.port);
			return Ok(());
		};

		self.conn_router.create(key, State::Established, self.config.frame_length, read_fwd, closed_fwd, self.config.id.clone())?;
		self.incoming_fwd.fwd(key);
		Ok(())
	}

	fn on_data(&mut self, frame: Frame) -> Result<(), Error> {
		let Some(local) = frame.call_to.as_call()? else { return Ok(()) };
		let Some(remote) = frame.call_from.as_call()? else { return Ok(()) };

		self.conn_router.on_data(&ConnKey { port: frame.tnc_port, local, remote }, &frame.payload);
		Ok(())
	}

	fn on_disconnect(&mut self, cx: CX![], frame: Frame) -> Result<(), Error> {
		let Some(local) = frame.call_to.as_call()? else { return Ok(()) };
		let Some(remote) = frame.call_from.as_call()? else { return Ok(()) };

		let ready = self.conn_router.on_remote_close(&ConnKey { port: frame.tnc_port, local, remote });
		self.dispatch_ready_frames(cx, ready)
	}

	fn on_port_frames(&mut self, cx: CX![], frame: Frame) -> Result<(), Error> {
		if frame.payload.len() < 4 {
			return Err(Error::MalformedFrame("'y' reply shorter than expected"));
		}

		let port = frame.tnc_port;
		let inflight = u32::from_le_bytes(frame.payload[0..4].try_into().expect("checked length"));
		self.port_router.on_frames_outstanding(port, inflight);

		while self.port_router.should_drain(port) {
			let Some(queued) = self.port_router.drain_one(port) else { break };
			self.sender.send(&queued).map_err(|()| Error::Transport(std::io::Error::other("send failed")))?;
		}

		if self.port_router.has_pending(port) {
			self.arm_port_poll_timer(cx, port);
		}

		Ok(())
	}

	fn on_conn_frames(&mut self, cx: CX![], frame: Frame) -> Result<(), Error> {
		if frame.payload.len() < 4 {
			return Err(Error::MalformedFrame("'Y' reply shorter than expected"));
		}

		let Some(local) = frame.call_to.as_call()? else { return Ok(()) };
		let Some(remote) = frame.call_from.as_call()? else { return Ok(()) };
		let inflight = u32::from_le_bytes(frame.payload[0..4].try_into().expect("checked length"));

		let key = ConnKey { port: frame.tnc_port, local, remote };
		let ready = self.conn_router.on_frames_outstanding(&key, inflight);
		self.dispatch_ready_frames(cx, ready)
	}

	fn on_raw(&mut self, frame: Frame) -> Result<(), Error> {
		let packet = raw::decode_raw_payload(&frame.payload)?;
		self.monitor_fwd.fwd(MonitorEvent::Raw { port: frame.tnc_port, packet });
		Ok(())
	}

	fn on_monitor(&mut self, frame: Frame) -> Result<(), Error> {
		self.monitor_fwd.fwd(MonitorEvent::Monitor { port: frame.tnc_port, kind: frame.data_kind, text: frame.payload.to_vec() });
		Ok(())
	}

	/// Called once a connection's poll timer fires: re-query its in-flight count.
	pub(crate) fn on_conn_poll_tick(&mut self, cx: CX![], key: ConnKey) {
		let Some(conn) = self.conn_router.get_mut(&key) else { return };

		if !conn.poll_tick() {
			return;
		}

		let query = conn.query_frame();

		if let Err(()) = self.sender.send(&query) {
			error!("Failed to send '{:?}' query for {:?}", query.data_kind, key);
			return;
		}

		if let Some(conn) = self.conn_router.get_mut(&key) {
			conn.arm_poll_timer(cx);
		}
	}

	/// Called once a connection's coalescing timer fires: flush the buffer.
	pub(crate) fn on_conn_coalesce_tick(&mut self, cx: CX![], key: ConnKey) {
		let Some(conn) = self.conn_router.get_mut(&key) else { return };
		conn.coalesce_tick();
		let Some(frame) = conn.flush_coalesce() else { return };

		if let Err(err) = self.send_through_port(cx, frame) {
			error!("Failed to flush coalesced data for {:?}: {err}", key);
		}
	}

	/// Ensure a port throttle exists for `port` (spec §4.5: created lazily on
	/// first inbound frame for a port, or first outbound use by
	/// `createConnection`), sending the initial `'y'` query that seeds its
	/// in-flight counter when this is the first time the port is touched.
	fn note_port_seen(&mut self, port: u8) {
		if self.port_router.ensure_port(port) {
			let query = crate::port_throttle::query_frame(port);

			if let Err(()) = self.sender.send(&query) {
				error!("Failed to send initial 'y' query for port {port}");
			}
		}
	}

	/// Offer one frame to the port throttle below the connection/raw layer
	/// that produced it (spec §2's egress pipeline), sending it immediately
	/// if the port is open or queuing it and arming the port's poll timer
	/// otherwise.
	fn send_through_port(&mut self, cx: CX![], frame: Frame) -> Result<(), Error> {
		let port = frame.tnc_port;
		self.note_port_seen(port);

		match self.port_router.offer(frame) {
			Some(frame) => {
				self.sender.send(&frame).map_err(|()| Error::Transport(std::io::Error::other("send failed")))?;

				if self.port_router.wants_lookahead_query(port) {
					let query = crate::port_throttle::query_frame(port);
					let _ = self.sender.send(&query);
				}
			}
			None => self.arm_port_poll_timer(cx, port),
		}

		Ok(())
	}

	/// Offer every frame released by a connection's throttle to its port
	/// throttle, in order.
	fn dispatch_ready_frames(&mut self, cx: CX![], frames: Vec<Frame>) -> Result<(), Error> {
		for frame in frames {
			self.send_through_port(cx, frame)?;
		}

		Ok(())
	}

	fn arm_port_poll_timer(&mut self, cx: CX![], port: u8) {
		if self.port_poll_timers.contains_key(&port) {
			return;
		}

		let actor = cx.access_actor().clone();
		let timer = cx.after(POLL_INTERVAL, move |s| actor.apply(s, move |this: &mut Server, cx| this.on_port_poll_tick(cx, port)));
		self.port_poll_timers.insert(port, timer);
	}

	/// Called once a blocked port's poll timer fires: re-query its in-flight
	/// count. Keeps re-arming every [`POLL_INTERVAL`] while frames remain
	/// queued for the port (spec §4.7); stops once it drains.
	pub(crate) fn on_port_poll_tick(&mut self, cx: CX![], port: u8) {
		self.port_poll_timers.remove(&port);

		if !self.port_router.has_pending(port) {
			return;
		}

		let query = crate::port_throttle::query_frame(port);

		if let Err(()) = self.sender.send(&query) {
			error!("Failed to send 'y' query for port {port}");
			return;
		}

		self.arm_port_poll_timer(cx, port);
	}

	/// Register a call sign with the TNC on `port` (`'X'`, spec §4.1/§4.11:
	/// `listen()`/`connect()` issue one of these per `(port, callSign)` pair,
	/// skipping the round trip if the TNC already accepted it).
	pub fn register(&mut self, port: u8, call: CallSign, ret: Ret<RegistrationResult>) {
		self.register_then(port, call, move |_server, result| ret.ret(result));
	}

	/// Register `call` on `port`, then run `then` once the outcome is known
	/// (spec §4.11: `listen()`/`connect()` both register before proceeding).
	/// Skips straight to `then` if this `(port, call)` was already accepted
	/// by a previous registration; otherwise queues behind any registration
	/// already in flight, since only one `'X'` request is outstanding at a
	/// time (see `pending_register`'s doc comment).
	fn register_then(&mut self, port: u8, call: CallSign, then: impl FnOnce(&mut Server, RegistrationResult) + 'static) {
		if self.registered.contains(&(port, call)) {
			then(self, RegistrationResult::Ok(call));
			return;
		}

		if self.pending_register.is_some() {
			self.register_queue.push_back((port, call, Box::new(then)));
		} else {
			self.start_register(port, call, Box::new(then));
		}
	}

	fn start_register(&mut self, port: u8, call: CallSign, then: Box<dyn FnOnce(&mut Server, RegistrationResult)>) {
		let frame = Frame::control(port, DataKind::REGISTER, CallField::from_call(call), CallField::EMPTY);
		self.pending_register = Some(PendingRegister { port, call, then });

		if let Err(()) = self.sender.send(&frame) {
			if let Some(pending) = self.pending_register.take() {
				(pending.then)(self, RegistrationResult::Failed(pending.call));
			}

			self.advance_register_queue();
		}
	}

	/// Start the next queued registration, if any and none is already in flight.
	fn advance_register_queue(&mut self) {
		if self.pending_register.is_some() {
			return;
		}

		let Some((port, call, then)) = self.register_queue.pop_front() else { return };

		if self.registered.contains(&(port, call)) {
			then(self, RegistrationResult::Ok(call));
			self.advance_register_queue();
		} else {
			self.start_register(port, call, then);
		}
	}

	/// Request the TNC's port list (`'G'`).
	pub fn list_ports(&mut self, ret: Ret<Result<Vec<(u8, String)>, Error>>) {
		if self.port_router.ports().next().is_some() {
			let listing: Vec<(u8, String)> = self.port_router.ports().filter_map(|p| Some((p, self.port_router.description(p)?.to_string()))).collect();
			ret.ret(Ok(listing));
			return;
		}

		let first_waiter = self.pending_port_list.is_empty();
		self.pending_port_list.push(PortListWaiter::Report(ret));
		self.request_port_list_if_needed(first_waiter);
	}

	fn request_port_list_if_needed(&mut self, already_requested: bool) {
		if already_requested {
			return;
		}

		let frame = Frame::control(0, DataKind::PORT_INFO, CallField::EMPTY, CallField::EMPTY);

		if let Err(()) = self.sender.send(&frame) {
			for waiter in std::mem::take(&mut self.pending_port_list) {
				match waiter {
					PortListWaiter::Report(ret) => ret.ret(Err(Error::Transport(std::io::Error::other("send failed")))),
					PortListWaiter::Listen(pending) => pending.ret.ret(Err(Error::Transport(std::io::Error::other("send failed")))),
				}
			}
		}
	}

	/// Request the TNC's reported version (`'R'`).
	pub fn version(&mut self, ret: Ret<(u16, u16)>) {
		self.pending_version = Some(ret);
		let frame = Frame::control(0, DataKind::VERSION, CallField::EMPTY, CallField::EMPTY);
		let _ = self.sender.send(&frame);
	}

	pub fn port_caps(&self, port: u8) -> Option<PortCaps> {
		self.port_router.caps(port)
	}

	/// Begin listening for inbound connections to `local` on `port` (spec
	/// §4.11): waits for the TNC's port list if it isn't known yet, fails
	/// with [`Error::NoPorts`] (ENOENT) if the TNC advertises none, registers
	/// `local` on `port` if that hasn't already succeeded, and only then
	/// starts accepting `'C'` frames for the pair — `ret` reports once all of
	/// that has happened (or why it didn't). Incoming connections are
	/// announced via the `incoming_fwd` passed to [`Server::init`]; subsequent
	/// `'D'`/close events for that connection go to `read_fwd`/`closed_fwd`.
	pub fn listen(&mut self, port: u8, local: CallSign, read_fwd: Fwd<Bytes>, closed_fwd: Fwd<bool>, ret: Ret<Result<(), Error>>) {
		let pending = PendingListen { port, local, read_fwd, closed_fwd, ret };

		if self.port_router.ports().next().is_some() {
			self.listen_with_ports_known(pending);
			return;
		}

		let first_waiter = self.pending_port_list.is_empty();
		self.pending_port_list.push(PortListWaiter::Listen(pending));
		self.request_port_list_if_needed(first_waiter);
	}

	/// Finish `listen()` once the port list is known to be non-empty:
	/// register the call sign (if needed), then start accepting for it.
	fn listen_with_ports_known(&mut self, pending: PendingListen) {
		if self.port_router.ports().next().is_none() {
			pending.ret.ret(Err(Error::NoPorts));
			return;
		}

		let PendingListen { port, local, read_fwd, closed_fwd, ret } = pending;

		self.register_then(port, local, move |server, result| match result {
			RegistrationResult::Ok(_) => {
				server.listeners.insert((port, local), (read_fwd, closed_fwd));
				ret.ret(Ok(()));
			}
			RegistrationResult::Failed(call) => ret.ret(Err(Error::RegistrationFailed { call })),
		});
	}

	pub fn unlisten(&mut self, port: u8, local: CallSign) {
		self.listeners.remove(&(port, local));
	}

	/// Open an outbound connection (`'C'`/`'v'`, spec §4.1/§4.11): registers
	/// `local` on `port` first if that hasn't already succeeded, then sends
	/// the connect frame. The connection record is created up front (so a
	/// second `connect()` to the same triple fails with
	/// [`Error::AddrInUse`](crate::Error::AddrInUse) immediately, rather than
	/// only once registration completes).
	pub fn connect(&mut self, port: u8, local: CallSign, remote: CallSign, path: Path, read_fwd: Fwd<Bytes>, closed_fwd: Fwd<bool>) -> Result<(), Error> {
		let key = ConnKey { port, local, remote };
		self.conn_router.create(key, State::Pending, self.config.frame_length, read_fwd, closed_fwd, self.config.id.clone())?;
		self.note_port_seen(port);

		self.register_then(port, local, move |server, result| {
			if let RegistrationResult::Failed(call) = result {
				warn!("Registration of {call} on port {port} failed; attempting connect to {remote} anyway");
			}

			let frame = if path.is_empty() {
				Frame::control(port, DataKind::CONNECT, CallField::from_call(local), CallField::from_call(remote))
			} else {
				encode_connect_via(port, local, remote, &path)
			};

			if let Err(()) = server.sender.send(&frame) {
				error!("Failed to send connect frame for ({port}, {local}, {remote})");
			}
		});

		Ok(())
	}

	/// Write application data to an established connection. Frames admitted
	/// by the connection throttle are then offered to the port throttle
	/// below it (spec §2's egress pipeline) before reaching the socket.
	pub fn write(&mut self, cx: CX![], key: ConnKey, data: &[u8]) -> Result<(), Error> {
		let conn = self.conn_router.get_mut(&key).ok_or(Error::NoSuchPort { port: key.port })?;
		let ready = conn.write(cx, data);
		let query = conn.wants_lookahead_query().then(|| conn.query_frame());

		self.dispatch_ready_frames(cx, ready)?;

		if let Some(query) = query {
			let _ = self.sender.send(&query);
		}

		Ok(())
	}

	/// Close a connection gracefully (spec §4.8/§4.10): drains queued/in-flight
	/// data, sends `'d'`, then — if this server was constructed with an `id` —
	/// the tail `'M'` UNPROTO identification frame.
	pub fn close(&mut self, cx: CX![], key: ConnKey) -> Result<(), Error> {
		let conn = self.conn_router.get_mut(&key).ok_or(Error::NoSuchPort { port: key.port })?;
		let ready = conn.close(cx);
		self.dispatch_ready_frames(cx, ready)?;
		self.conn_router.reap_if_closed(&key);
		Ok(())
	}

	/// Inject a raw AX.25 packet on `port` (`'K'`, raw mode). `'K'` is
	/// data-bearing (it keys the radio), so it is gated through the port
	/// throttle exactly like a connected-mode `'D'` frame.
	pub fn inject_raw(&mut self, cx: CX![], port: u8, packet: &ax25::Packet) -> Result<(), Error> {
		let frame = raw::encode_raw_frame(port, packet)?;
		self.send_through_port(cx, frame)
	}

	/// Toggle whether raw frames are delivered for `port` (`'k'`).
	pub fn set_raw_mode(&mut self, port: u8, enabled: bool) -> Result<(), Error> {
		let mut payload = Bytes::new(1);
		payload.copy_from_slice(&[enabled as u8]);
		let frame = Frame::control(port, DataKind::RAW_TOGGLE, CallField::EMPTY, CallField::EMPTY).with_payload(payload);
		self.sender.send(&frame).map_err(|()| Error::Transport(std::io::Error::other("send failed")))
	}
}

/// Build the `'v'` connect-via-path frame (spec §4.11): a one-byte digipeater
/// count followed by 10 bytes per digipeater (the same 9-ASCII-bytes-plus-NUL
/// layout as [`CallField`], reused here rather than reinvented).
fn encode_connect_via(port: u8, local: CallSign, remote: CallSign, path: &Path) -> Frame {
	let mut raw = Vec::with_capacity(1 + path.len() * 10);
	raw.push(path.len() as u8);

	for digi in path.iter() {
		raw.extend_from_slice(&CallField::from_call(digi.call).0);
	}

	let mut payload = Bytes::new(raw.len());
	payload.copy_from_slice(&raw);

	Frame::control(port, DataKind::CONNECT_VIA, CallField::from_call(local), CallField::from_call(remote)).with_payload(payload)
}

#[cfg(test)]
mod tests {
	use std::cell::RefCell;
	use std::rc::Rc;

	use super::*;
	use crate::assembler::Assembler;
	use crate::conn_throttle::ConnThrottle;

	fn call(s: &str) -> CallSign {
		CallSign::parse(s).unwrap()
	}

	/// Reproduces `Connection::write`/`Server::send_through_port`'s egress
	/// pipeline (spec §2) without an actor context: push bytes through the
	/// assembler, offer each chunk to the connection throttle, then offer
	/// whatever it releases to the port throttle below it. A mock TNC in
	/// these tests is just the sequence of frames this pipeline hands back —
	/// the same frames `Sender` would have put on the wire.
	struct MockPipeline {
		assembler: Assembler,
		conn_throttle: ConnThrottle,
		port_router: PortRouter,
		port: u8,
		from: CallSign,
		to: CallSign,
	}

	impl MockPipeline {
		fn new(port: u8, frame_length: usize, from: CallSign, to: CallSign) -> Self {
			let mut port_router = PortRouter::new();
			port_router.ensure_port(port);

			Self { assembler: Assembler::new(frame_length), conn_throttle: ConnThrottle::new(0, 8), port_router, port, from, to }
		}

		fn data_frame(&self, chunk: Vec<u8>) -> Frame {
			let mut payload = Bytes::new(chunk.len());
			payload.copy_from_slice(&chunk);
			Frame::control(self.port, DataKind::DATA, CallField::from_call(self.from), CallField::from_call(self.to)).with_payload(payload)
		}

		fn offer_through_port(&mut self, frame: Option<Frame>) -> Option<Frame> {
			frame.and_then(|frame| self.port_router.offer(frame))
		}

		/// Mirrors `Connection::write` + `Server::send_through_port`.
		fn write(&mut self, data: &[u8]) -> Vec<Frame> {
			let mut sent = Vec::new();

			for chunk in self.assembler.push(data) {
				let frame = self.data_frame(chunk);
				let offered = self.conn_throttle.offer(frame);
				sent.extend(self.offer_through_port(offered));
			}

			sent
		}

		/// Mirrors `Server::on_conn_frames`: record the TNC's reported
		/// in-flight count, then drain whatever the connection throttle now
		/// releases through the port throttle.
		fn on_y_reply(&mut self, inflight: u32) -> Vec<Frame> {
			self.conn_throttle.on_query_reply(inflight);
			let mut released = Vec::new();

			while self.conn_throttle.should_drain() {
				let Some(frame) = self.conn_throttle.drain_one() else { break };
				released.extend(self.offer_through_port(Some(frame)));
			}

			released
		}

		/// Mirrors `Connection::close` + drain: request the final frames and
		/// return whatever is immediately safe to send.
		fn close(&mut self, id: Option<&str>) -> Vec<Frame> {
			let disconnect = Frame::control(self.port, DataKind::DISCONNECT, CallField::from_call(self.from), CallField::from_call(self.to));
			let mut finals = vec![disconnect];

			if let Some(id) = id {
				let latin1: Vec<u8> = id.bytes().collect();
				let mut payload = Bytes::new(latin1.len());
				payload.copy_from_slice(&latin1);
				let call_to = CallField::from_call(call("ID"));
				finals.push(Frame::control(self.port, DataKind::UNPROTO, CallField::from_call(self.from), call_to).with_payload(payload));
			}

			self.conn_throttle.request_close(finals);

			let mut released = Vec::new();
			while let Some(frame) = self.conn_throttle.take_final_frame() {
				released.extend(self.offer_through_port(Some(frame)));
			}

			released
		}
	}

	/// Scenario C (spec §8): an inbound `'C'` frame for (port=0,
	/// callFrom='W1AW', callTo='N0CALL') is recognized by the connection
	/// router, and the application's subsequent write is emitted as a 'D'
	/// frame with the expected addressing and payload.
	#[test]
	fn scenario_c_inbound_connect_and_echo() {
		let key = ConnKey { port: 0, local: call("N0CALL"), remote: call("W1AW") };

		let mut router = ConnRouter::new();
		assert!(!router.contains(&key));

		let seen = Rc::new(RefCell::new(Vec::new()));
		let seen_clone = Rc::clone(&seen);
		let read_fwd = Fwd::new(move |data: Bytes| seen_clone.borrow_mut().push(data.to_vec()));

		router.create(key, State::Established, 128, read_fwd, Fwd::new(|_: bool| {}), None).unwrap();
		assert!(router.contains(&key));

		// The mock TNC's own 'D' frame for this connection reaches the application.
		router.on_data(&key, b"inbound");
		assert_eq!(seen.borrow().as_slice(), [b"inbound".to_vec()]);

		let mut pipeline = MockPipeline::new(key.port, 128, key.local, key.remote);
		let sent = pipeline.write(b"HI");

		assert_eq!(sent.len(), 1);
		let frame = &sent[0];
		assert_eq!(frame.data_kind, DataKind::DATA);
		assert_eq!(frame.tnc_port, 0);
		assert_eq!(&frame.payload[..], b"HI");
		assert_eq!(frame.call_to.as_call().unwrap(), Some(key.remote));
		assert_eq!(frame.call_from.as_call().unwrap(), Some(key.local));
	}

	/// Scenario D (spec §8): closing a connection emits the `'d'` disconnect
	/// followed by the tail `'M'` identification frame, in order, once the
	/// queue is drained.
	#[test]
	fn scenario_d_graceful_disconnect_with_id() {
		let mut pipeline = MockPipeline::new(0, 128, call("N0CALL"), call("W1AW"));

		// A prior 'Y' reply already reported the link idle (inflight 0),
		// clearing the Direwolf-quirk seed so the close can drain immediately.
		pipeline.on_y_reply(0);

		let sent = pipeline.close(Some("MYID"));
		let kinds: Vec<_> = sent.iter().map(|f| f.data_kind).collect();

		assert_eq!(kinds, vec![DataKind::DISCONNECT, DataKind::UNPROTO]);
		assert_eq!(&sent[1].payload[..], b"MYID");
	}

	/// Scenario E (spec §8): writing far more data than the throttle's high
	/// watermark allows in flight never emits more than 8 'D' frames before
	/// the next 'Y' reply, and chunk ordering survives the queue/drain cycle.
	#[test]
	fn scenario_e_flow_control_caps_in_flight_frames() {
		let mut pipeline = MockPipeline::new(0, 128, call("N0CALL"), call("W1AW"));

		let mut immediate = Vec::new();
		for _ in 0..10 {
			immediate.extend(pipeline.write(&[0xAB; 200]));
		}

		// ConnThrottle seeds inflight at 1 (Direwolf quirk) with high=8, so at
		// most 7 more frames can dispatch immediately before the throttle closes.
		assert!(immediate.len() <= 8, "at most 8 'D' frames may be in flight before the next 'Y' reply, got {}", immediate.len());
		assert!(pipeline.conn_throttle.has_pending(), "remaining chunks should have queued once the throttle closed");

		let drained = pipeline.on_y_reply(0);
		assert!(!drained.is_empty(), "a 'Y' reply reporting 0 in flight should release the queued frames");

		for frame in drained {
			assert_eq!(frame.data_kind, DataKind::DATA);
			assert!(frame.payload.iter().all(|&b| b == 0xAB));
		}
	}
}
