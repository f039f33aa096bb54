//! Everything that makes up one connection: wire framing, the byte
//! transport, command/response correlation, pub/sub dispatch, and the state
//! machine tying them together.

pub mod core;
pub mod correlator;
pub mod frame;
pub mod pubsub;
pub mod transport;

pub use core::{Connection, ConnectionId, LoggingConnection};
