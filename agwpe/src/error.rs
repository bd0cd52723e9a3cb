use std::io::ErrorKind;

use crate::callsign::CallSign;

/// The error taxonomy applications see: validation, registration, TNC-topology,
/// transport, and protocol errors (see spec §7). Each variant's [`Error::kind`]
/// maps to the `std::io::ErrorKind` an application would conventionally match on
/// (EACCES/ENOENT/ECONNREFUSED/ETIMEDOUT), since this library has no socket
/// errno of its own to invent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Raised synchronously from the call that received a malformed call sign.
	#[error("invalid call sign: {0}")]
	InvalidCallSign(String),

	/// Raised synchronously when a call sign's SSID is out of `[0,15]`.
	#[error("invalid SSID in call sign: {0}")]
	InvalidSsid(String),

	/// Raised synchronously when a requested TNC port index is out of range.
	#[error("invalid TNC port: {0}")]
	InvalidPort(u8),

	/// Raised synchronously when a digipeater path exceeds 8 stations.
	#[error("digipeater path exceeds 8 stations")]
	ViaPathTooLong,

	/// The TNC rejected an 'X' registration for `call` (payload byte 0).
	#[error("call sign {call} was not accepted by the TNC")]
	RegistrationFailed { call: CallSign },

	/// The TNC has no such port (requested listen/connect port is not advertised).
	#[error("TNC has no port {port}")]
	NoSuchPort { port: u8 },

	/// The TNC's 'G' port-list reply advertised zero ports.
	#[error("TNC advertised no ports")]
	NoPorts,

	/// `create_connection` was called for a `(port, local, remote)` triple that
	/// already has a live connection.
	#[error("a connection to ({port}, {local}, {remote}) already exists")]
	AddrInUse { port: u8, local: CallSign, remote: CallSign },

	/// The underlying TCP socket to the TNC failed.
	#[error("transport error: {0}")]
	Transport(#[from] std::io::Error),

	/// A malformed AGWPE frame was received; the byte stream's framing is now
	/// assumed lost and the Server tears itself down.
	#[error("malformed AGWPE frame: {0}")]
	MalformedFrame(&'static str),

	/// A malformed AX.25 packet was decoded (raw mode only).
	#[error("malformed AX.25 packet: {0}")]
	MalformedPacket(&'static str),

	/// A 'D' frame arrived for a connection after the application had already
	/// closed its write side.
	#[error("received data after local close")]
	ReceiveAfterClose,

	/// A 'D' frame arrived while the application's read side was still
	/// signalling backpressure from the previous one.
	#[error("receive buffer overflow")]
	ReceiveBufferOverflow,
}

impl Error {
	/// The conventional `ErrorKind` an application should match on.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::InvalidCallSign(_) | Error::InvalidSsid(_) | Error::InvalidPort(_) | Error::ViaPathTooLong => ErrorKind::InvalidInput,
			Error::RegistrationFailed { .. } => ErrorKind::PermissionDenied,
			Error::NoSuchPort { .. } | Error::NoPorts => ErrorKind::NotFound,
			Error::AddrInUse { .. } => ErrorKind::AddrInUse,
			Error::Transport(err) => err.kind(),
			Error::MalformedFrame(_) | Error::MalformedPacket(_) | Error::ReceiveAfterClose | Error::ReceiveBufferOverflow => ErrorKind::InvalidData,
		}
	}
}

/// The outcome of registering a call sign with the TNC via 'X'. A union type
/// in place of the original's "callback receives undefined, a string, or an
/// error" convention (see spec §9 redesign flags).
#[derive(Debug, Clone)]
pub enum RegistrationResult {
	/// The TNC accepted the call sign.
	Ok(CallSign),
	/// The TNC rejected the call sign (payload byte 0 was `0`).
	Failed(CallSign),
}
