//! Realtime channel: protocol messages and the transport capability.

mod protocol;
mod transport;

pub use protocol::*;
pub use transport::*;
