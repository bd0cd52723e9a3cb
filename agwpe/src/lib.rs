#![feature(try_blocks)]

//! Client-side AGWPE/AX.25 networking middleware (spec §1): an ordinary
//! stream-socket-shaped surface over a TNC's AGWPE TCP control protocol.
//!
//! [`Server`] owns the single TCP connection to the TNC and is the crate's
//! entry point; everything else is plumbing it assembles: the [`frame`] and
//! [`ax25`] codecs, the [`receiver`]/[`sender`] pair that turn the socket's
//! byte stream into/from AGWPE frames, the [`port_router`]/[`conn_router`]
//! dispatch tables, the [`port_throttle`]/[`conn_throttle`] flow control, the
//! [`assembler`] that cuts an application's byte stream into data frames, and
//! the [`connection`] type that ties a session's throttle and assembler
//! together behind a `localAddress`/`remoteAddress`/`tncPort` view.

mod assembler;
pub mod ax25;
mod callsign;
mod conn_router;
mod conn_throttle;
mod connection;
mod error;
mod frame;
mod port_router;
mod port_throttle;
mod raw;
mod receiver;
mod sender;
mod server;
mod throttle;

pub use callsign::CallSign;
pub use conn_router::ConnKey;
pub use connection::State as ConnectionState;
pub use error::{Error, RegistrationResult};
pub use frame::DataKind;
pub use port_router::PortCaps;
pub use raw::MonitorEvent;
pub use server::{Server, POLL_INTERVAL};
