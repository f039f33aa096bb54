use std::io;

use thiserror::Error;

/// Error raised while decoding a byte stream into a [`RespValue`](crate::resp::RespValue).
///
/// Only `Incomplete` is handled at runtime (it means "come back with more
/// bytes"); every other variant is fatal and closes the connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("protocol error; {0}")]
    Malformed(String),

    #[error("not enough data is available to parse a message")]
    Incomplete,

    #[error("protocol error; nested array depth exceeds the {0} frame limit")]
    MaxDepthExceeded(usize),

    #[error(transparent)]
    ParseInt(#[from] std::num::TryFromIntError),

    #[error(transparent)]
    ParseUtf8(#[from] std::string::FromUtf8Error),
}

/// The full error taxonomy surfaced by the public connection API.
///
/// RESP `Error` replies to a specific command are *not* represented here —
/// they resolve their promise successfully as `RespValue::Error` (see
/// `connection::correlator`). This enum covers everything that keeps a
/// command from ever getting a reply at all.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Attempt to use a connection after `close()` or while closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// `subscribe`/`psubscribe` attempted while `allow_subscriptions` is false.
    #[error("subscriptions are not allowed on this connection")]
    PubSubNotAllowed,

    /// A non pub/sub command was attempted while the connection is in `PubSub` state.
    #[error("command not allowed while in pub/sub mode")]
    InPubSubMode,

    /// A caller-contract violation, such as sending an empty command batch.
    #[error("assertion failure: {0}")]
    AssertionFailure(String),

    /// Malformed RESP from the server. Fatal; the transport is closed.
    #[error(transparent)]
    ProtocolError(#[from] ProtocolError),

    /// Socket I/O or TLS failure. Fatal; the transport is closed.
    #[error("transport error: {0}")]
    TransportError(#[from] io::Error),

    /// AUTH or SELECT was rejected during startup. Fatal.
    #[error("startup failed: {0}")]
    StartupFailed(String),

    /// A RESP `Error` value returned for a specific command, surfaced at the
    /// typed wrapper's discretion rather than failing the promise itself.
    #[error("server error: {0}")]
    ServerError(String),
}
