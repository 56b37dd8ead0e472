//! Comms interface and transport bindings for simbus.
//!
//! A comms instance moves [`ActionMessage`]s between co-simulation
//! processes. The transport-agnostic half lives in [`Comms`]: route
//! table, transmit queue, status flags, and the connect/disconnect
//! lifecycle. A [`CommsBinding`] supplies the two loops that do the I/O.
//!
//! # Bindings
//!
//! - [`TcpBinding`] (feature `tcp`, default): framed messages over TCP
//!   streams, optionally listening for peers.
//! - [`InprocBinding`]: endpoints connected through an in-process
//!   [`InprocHub`], for tests and single-process setups.
//!
//! # Feature Flags
//!
//! - `tcp` (default): the TCP binding
//! - `json` (default): load [`CommsConfig`]/[`TcpConfig`] from JSON

mod comms;
mod config;
mod error;
mod inproc;
mod queue;
mod routes;
mod status;
#[cfg(feature = "tcp")]
mod tcp;

use std::future::Future;
use std::sync::Arc;

pub use comms::{ActionCallback, Comms, CommsContext};
pub use config::{CommsConfig, TcpConfig};
pub use error::TransportError;
pub use inproc::{InprocBinding, InprocComms, InprocHub};
pub use queue::{Outgoing, QueueReceiver, TransmitQueue, transmit_queue};
pub use routes::{Resolution, RouteEntry, RouteTable};
pub use status::{ConnectionStatus, StatusFlag};
#[cfg(feature = "tcp")]
pub use tcp::{TcpBinding, TcpComms};

pub use simbus_protocol::{Action, ActionMessage, ProtocolCommand, RouteId};

/// The transport-specific half of a comms instance.
///
/// [`Comms`] calls [`prepare`](Self::prepare) and then spawns
/// [`receive_loop`](Self::receive_loop) and
/// [`transmit_loop`](Self::transmit_loop) once per connection attempt.
/// Each loop reports its progress through the status flags on the
/// [`CommsContext`]:
///
/// - `Connected` once it is ready for traffic,
/// - `Error` if it cannot get there or loses its connection,
/// - a normal exit leaves it to [`CommsContext::close_rx`]/[`close_tx`].
///
/// [`close_tx`]: CommsContext::close_tx
pub trait CommsBinding: Send + Sync + 'static {
    /// Short transport name for logs.
    fn kind(&self) -> &'static str;

    /// Resets per-attempt state. Called before the loops are spawned.
    fn prepare(&self, config: &CommsConfig) -> Result<(), TransportError>;

    /// Receives, decodes, and dispatches inbound messages until told to
    /// stop.
    fn receive_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
    ) -> impl Future<Output = ()> + Send + 'static;

    /// Drains `queue` onto the transport until it sees the close
    /// instruction for the current attempt, then hands the queue back.
    fn transmit_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
        queue: QueueReceiver,
    ) -> impl Future<Output = QueueReceiver> + Send + 'static;

    /// Asks the receiver loop to stop. Must not block.
    fn close_receiver(&self);

    /// Asks the transmitter loop to stop once it has sent what is already
    /// queued.
    fn close_transmitter(&self, ctx: &CommsContext) {
        ctx.queue()
            .push(RouteId::CONTROL, CommsContext::close_instruction(ctx.attempt()));
    }

    /// The address peers use to reach this instance, if the binding
    /// publishes one.
    fn address(&self) -> Option<String> {
        None
    }
}
