//! AX.25 packet codec (spec §4.2): address-field encoding and the control-byte
//! state machine, layered on top of the call-sign type shared with the AGWPE
//! frame codec.

pub mod address;
pub mod packet;

pub use address::{Digipeater, Path, ADDRESS_LEN, MAX_DIGIPEATERS};
pub use packet::{Packet, Type, PID_NO_LAYER3};
