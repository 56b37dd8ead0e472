//! # simbus
//!
//! Message transport for co-simulation cores and brokers.
//!
//! A comms instance carries [`ActionMessage`]s between processes over a
//! pluggable transport. Producers hand messages to
//! [`transmit`](Comms::transmit) and move on; a transmitter loop resolves
//! each route and writes the frame, and a receiver loop deframes inbound
//! traffic and hands it to the registered callback.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use simbus::prelude::*;
//!
//! # async fn run() -> Result<(), SimbusError> {
//! let broker = TcpComms::default();
//! broker.set_name("broker");
//! broker.set_server_mode(true);
//! broker.set_callback(|msg| println!("{} from {}", msg.action, msg.name));
//! simbus::connect(&broker).await?;
//!
//! let core = TcpComms::default();
//! core.set_name("core1");
//! core.load_target_info("localhost", broker.address());
//! simbus::connect(&core).await?;
//! core.transmit(RouteId::PARENT, Action::Data);
//! # Ok(())
//! # }
//! ```

mod error;
pub mod logging;

pub use error::SimbusError;

pub use simbus_protocol::{
    Action, ActionMessage, Deframer, FrameHeader, ProtocolCommand, ProtocolError, RouteId,
};
#[cfg(feature = "tcp")]
pub use simbus_transport::{TcpBinding, TcpComms};
pub use simbus_transport::{
    Comms, CommsBinding, CommsConfig, CommsContext, ConnectionStatus, InprocBinding, InprocComms,
    InprocHub, TcpConfig, TransportError,
};

/// Connects `comms`, turning a failed attempt into an error that names
/// the instance and the status each side ended in.
pub async fn connect<B: CommsBinding>(comms: &Comms<B>) -> Result<(), SimbusError> {
    if comms.connect().await {
        return Ok(());
    }
    Err(SimbusError::ConnectFailed {
        name: comms.name(),
        rx: comms.rx_status(),
        tx: comms.tx_status(),
    })
}

/// Common imports.
pub mod prelude {
    pub use crate::SimbusError;
    #[cfg(feature = "tcp")]
    pub use crate::TcpComms;
    pub use crate::{
        Action, ActionMessage, Comms, CommsBinding, CommsConfig, ConnectionStatus, InprocComms,
        InprocHub, ProtocolCommand, RouteId, TcpConfig,
    };
}
