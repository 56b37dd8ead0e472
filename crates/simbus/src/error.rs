//! Unified error type for simbus.

use simbus_protocol::ProtocolError;
use simbus_transport::{ConnectionStatus, TransportError};

/// Top-level error that wraps the error types of the member crates.
///
/// `transmit` never returns an error, so this mostly shows up around
/// configuration and `connect`.
#[derive(Debug, thiserror::Error)]
pub enum SimbusError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// `connect` reported failure.
    #[error("{name} failed to connect (receiver {rx}, transmitter {tx})")]
    ConnectFailed {
        name: String,
        rx: ConnectionStatus,
        tx: ConnectionStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let simbus_err: SimbusError = err.into();
        assert!(matches!(simbus_err, SimbusError::Transport(_)));
        assert!(simbus_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::UnsupportedVersion(9);
        let simbus_err: SimbusError = err.into();
        assert!(matches!(simbus_err, SimbusError::Protocol(_)));
    }

    #[test]
    fn test_connect_failed_message() {
        let err = SimbusError::ConnectFailed {
            name: "core1".into(),
            rx: ConnectionStatus::Connected,
            tx: ConnectionStatus::Error,
        };
        assert_eq!(
            err.to_string(),
            "core1 failed to connect (receiver connected, transmitter error)"
        );
    }
}
