use std::time::Duration;

use simbus_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
///
/// None of these escape through `transmit`: the comms loops log them and
/// reflect lasting failures in the connection status instead.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Dialing a peer or broker failed.
    #[error("connect to {target} failed: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Binding a listener failed.
    #[error("bind to {addr} failed: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// An operation did not finish within its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A route or broker target could not be interpreted.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A message could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The comms instance has been disconnected for good.
    #[error("comms instance terminated")]
    Terminated,

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,

    /// Configuration was rejected.
    #[error("configuration error: {0}")]
    Config(String),
}
