//! Comms configuration.
//!
//! [`CommsConfig`] holds what every transport needs; [`TcpConfig`] adds
//! the stream-socket settings. Both are plain serde structs so they can be
//! loaded from a JSON file, and both are only consulted when `connect`
//! runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[cfg(feature = "json")]
use crate::TransportError;

// ---------------------------------------------------------------------------
// CommsConfig
// ---------------------------------------------------------------------------

/// Settings shared by every transport binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommsConfig {
    /// This instance's logical name, sent during the registration handshake.
    pub name: String,

    /// Local interface identifier (host name or address to listen on).
    pub local_target: String,

    /// Broker identifier. Empty means "no broker" for a listening instance
    /// and `localhost` for a dialing one.
    pub broker_target: String,

    /// How long `connect` may take before it reports failure.
    pub connect_timeout_ms: u64,

    /// Largest message body accepted or sent, in bytes.
    pub max_message_size: usize,

    /// Queue depth above which enqueues are logged as a backlog warning.
    pub max_queue_depth: usize,

    /// How long `disconnect` waits for each loop before aborting it.
    pub disconnect_grace_ms: u64,
}

impl Default for CommsConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            local_target: "localhost".to_string(),
            broker_target: String::new(),
            connect_timeout_ms: Self::DEFAULT_CONNECT_TIMEOUT_MS,
            max_message_size: Self::DEFAULT_MAX_MESSAGE_SIZE,
            max_queue_depth: Self::DEFAULT_MAX_QUEUE_DEPTH,
            disconnect_grace_ms: 1_000,
        }
    }
}

impl CommsConfig {
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 4_000;
    pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;
    pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 1024;

    /// Creates a config with the given instance name and defaults otherwise.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Replaces zero limits and timeouts with their defaults.
    pub fn validated(mut self) -> Self {
        if self.connect_timeout_ms == 0 {
            warn!("connect_timeout_ms is 0, using default");
            self.connect_timeout_ms = Self::DEFAULT_CONNECT_TIMEOUT_MS;
        }
        if self.max_message_size == 0 {
            warn!("max_message_size is 0, using default");
            self.max_message_size = Self::DEFAULT_MAX_MESSAGE_SIZE;
        }
        if self.max_queue_depth == 0 {
            warn!("max_queue_depth is 0, using default");
            self.max_queue_depth = Self::DEFAULT_MAX_QUEUE_DEPTH;
        }
        self
    }

    /// Parses a config from JSON. Missing fields take their defaults.
    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json).map_err(|e| TransportError::Config(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// TcpConfig
// ---------------------------------------------------------------------------

/// Stream-socket settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Listen for incoming connections (`true`) or only dial the broker.
    pub server_mode: bool,

    /// Listening port. `None` or `Some(0)` lets the OS pick a free port.
    pub port: Option<u16>,

    /// Port of the broker to dial, unless `broker_target` carries one.
    pub broker_port: u16,

    /// Send a register-broker message after the connection info, as a
    /// subordinate broker does.
    pub register_as_broker: bool,

    /// Disable Nagle's algorithm on every connection.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            server_mode: false,
            port: None,
            broker_port: Self::DEFAULT_BROKER_PORT,
            register_as_broker: false,
            nodelay: true,
        }
    }
}

impl TcpConfig {
    pub const DEFAULT_BROKER_PORT: u16 = 24160;

    /// The port to bind, 0 meaning "any free port".
    pub fn listen_port(&self) -> u16 {
        self.port.unwrap_or(0)
    }

    /// Replaces a zero broker port with the default.
    pub fn validated(mut self) -> Self {
        if self.broker_port == 0 {
            warn!(
                default = Self::DEFAULT_BROKER_PORT,
                "broker_port is 0, using default"
            );
            self.broker_port = Self::DEFAULT_BROKER_PORT;
        }
        self
    }

    #[cfg(feature = "json")]
    pub fn from_json(json: &str) -> Result<Self, TransportError> {
        serde_json::from_str(json).map_err(|e| TransportError::Config(e.to_string()))
    }
}
