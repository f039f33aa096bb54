pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;

pub use connection::frame::RespValue;
pub use connection::{Connection, ConnectionId, LoggingConnection};
pub use error::{ConnectionError, ProtocolError};
