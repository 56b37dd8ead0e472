//! In-process binding.
//!
//! Endpoints register by name on a shared [`InprocHub`] and exchange
//! packetized frames over channels, so the framing and handshake paths
//! are the same as on a socket. The hub is an ordinary value passed to
//! each binding; there is no process-wide registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use simbus_protocol::{ActionMessage, Deframer, ProtocolCommand, RouteId};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::comms::wire_frame;
use crate::queue::QueueReceiver;
use crate::{
    Comms, CommsBinding, CommsConfig, CommsContext, ConnectionStatus, Resolution, TransportError,
};

/// A comms instance on an [`InprocHub`].
pub type InprocComms = Comms<InprocBinding>;

impl InprocComms {
    /// Creates an instance named `name` on `hub` whose parent is `broker`.
    /// An empty `broker` makes this instance a root with no parent.
    pub fn on_hub(hub: &InprocHub, name: impl Into<String>, broker: impl Into<String>) -> Self {
        let mut config = CommsConfig::named(name);
        config.broker_target = broker.into();
        Comms::with_config(InprocBinding::new(hub.clone()), config)
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Name → inbox directory shared by a set of in-process endpoints.
#[derive(Debug, Clone, Default)]
pub struct InprocHub {
    endpoints: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>,
}

impl InprocHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `name` and returns its inbox. A name whose previous owner
    /// dropped its inbox may be claimed again.
    pub fn register(&self, name: &str) -> Result<mpsc::UnboundedReceiver<Bytes>, TransportError> {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(name).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::InvalidTarget(format!(
                "endpoint {name} is already registered"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        endpoints.insert(name.to_string(), tx);
        Ok(rx)
    }

    /// Drops the registration for `name` once its inbox is gone. A newer
    /// owner that claimed the name in the meantime keeps it.
    pub fn release(&self, name: &str) -> bool {
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(name).is_some_and(|tx| tx.is_closed()) {
            endpoints.remove(name);
            return true;
        }
        false
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints
            .lock()
            .get(name)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Registered endpoint names, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<_> = self.endpoints.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Delivers a frame to `name`. Returns `false` if no live endpoint has
    /// that name.
    pub fn send(&self, name: &str, frame: Bytes) -> bool {
        let tx = self.endpoints.lock().get(name).cloned();
        match tx {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

struct InprocAttempt {
    name: String,
    broker: String,
    max_body: usize,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    close_rx: Notify,
}

/// [`CommsBinding`] over an [`InprocHub`].
pub struct InprocBinding {
    hub: InprocHub,
    attempt: Mutex<Option<Arc<InprocAttempt>>>,
}

impl InprocBinding {
    pub fn new(hub: InprocHub) -> Self {
        Self {
            hub,
            attempt: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &InprocHub {
        &self.hub
    }

    fn current(&self) -> Option<Arc<InprocAttempt>> {
        self.attempt.lock().clone()
    }

    fn send_to(&self, attempt: &InprocAttempt, target: &str, route: RouteId, msg: &ActionMessage) -> bool {
        let Some(frame) = wire_frame(msg, route, attempt.max_body) else {
            // Dropped and logged; not a delivery failure.
            return true;
        };
        self.hub.send(target, Bytes::from(frame))
    }

    fn handle_inbound(&self, attempt: &InprocAttempt, ctx: &CommsContext, msg: ActionMessage) {
        match msg.protocol_command() {
            Some(ProtocolCommand::ConnectionInfo) => {
                debug!(endpoint = %attempt.name, peer = %msg.name, "peer registered");
                let ack = ActionMessage::protocol(ProtocolCommand::ConnectionAck)
                    .with_name(attempt.name.as_str());
                if !self.send_to(attempt, &msg.name, RouteId::PARENT, &ack) {
                    warn!(peer = %msg.name, "cannot acknowledge registration");
                }
                ctx.dispatch(msg);
            }
            Some(ProtocolCommand::ConnectionAck) => {
                trace!(endpoint = %attempt.name, peer = %msg.name, "registration acknowledged");
            }
            Some(ProtocolCommand::Disconnect) => {
                debug!(endpoint = %attempt.name, peer = %msg.name, "peer said goodbye");
            }
            _ => ctx.dispatch(msg),
        }
    }

    async fn run_receiver(self: Arc<Self>, ctx: Arc<CommsContext>) {
        let Some(attempt) = self.current() else {
            ctx.set_rx_status(ConnectionStatus::Error);
            return;
        };
        let inbox = attempt.inbox.lock().take();
        let Some(mut inbox) = inbox else {
            error!(endpoint = %attempt.name, "inbox already taken");
            ctx.set_rx_status(ConnectionStatus::Error);
            return;
        };

        let mut deframer = Deframer::new(attempt.max_body);
        ctx.set_rx_status(ConnectionStatus::Connected);

        loop {
            tokio::select! {
                biased;
                _ = attempt.close_rx.notified() => break,
                _ = ctx.wait_until(|c| c.tx_status().is_finished()) => {
                    if ctx.tx_status() == ConnectionStatus::Error {
                        error!(endpoint = %attempt.name, "transmitter failed, stopping receiver");
                        ctx.set_rx_status(ConnectionStatus::Error);
                    }
                    break;
                }
                frame = inbox.recv() => {
                    let Some(frame) = frame else { break };
                    deframer.extend(&frame);
                    loop {
                        match deframer.next_message() {
                            Ok(Some(msg)) => self.handle_inbound(&attempt, &ctx, msg),
                            Ok(None) => break,
                            Err(e) => warn!(endpoint = %attempt.name, error = %e, "dropping corrupt frame"),
                        }
                    }
                }
            }
        }

        drop(inbox);
        self.hub.release(&attempt.name);
        debug!(endpoint = %attempt.name, "receiver stopped");
        ctx.close_rx();
    }

    async fn run_transmitter(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
        mut queue: QueueReceiver,
    ) -> QueueReceiver {
        let Some(attempt) = self.current() else {
            ctx.set_tx_status(ConnectionStatus::Error);
            return queue;
        };
        let id = ctx.attempt();
        let hello = ActionMessage::protocol(ProtocolCommand::ConnectionInfo)
            .with_name(attempt.name.as_str());
        let mut greeted = HashSet::new();

        if !attempt.broker.is_empty() {
            if !self.send_to(&attempt, &attempt.broker, RouteId::PARENT, &hello) {
                error!(endpoint = %attempt.name, broker = %attempt.broker, "broker is not on the hub");
                ctx.set_tx_status(ConnectionStatus::Error);
                return queue;
            }
            greeted.insert(attempt.broker.clone());
        }
        ctx.set_tx_status(ConnectionStatus::Connected);

        loop {
            let (route, msg) = tokio::select! {
                biased;
                _ = ctx.receiver_stopped() => break,
                item = queue.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let target = match ctx.routes().resolve(route) {
                Resolution::Control => {
                    if CommsContext::is_close_instruction(&msg, id) {
                        break;
                    }
                    continue;
                }
                Resolution::Direct(entry) if self.hub.contains(&entry.target) => entry.target,
                Resolution::Direct(entry) => {
                    debug!(%route, target = %entry.target, "peer not on hub, using parent route");
                    attempt.broker.clone()
                }
                Resolution::Parent => attempt.broker.clone(),
            };
            if target.is_empty() {
                warn!(%route, action = %msg.action, "no parent route, dropping message");
                continue;
            }

            if greeted.insert(target.clone()) {
                self.send_to(&attempt, &target, route, &hello);
            }
            if !self.send_to(&attempt, &target, route, &msg) {
                warn!(%route, %target, action = %msg.action, "endpoint gone, dropping message");
            }
        }

        if !attempt.broker.is_empty() {
            let goodbye = ActionMessage::protocol(ProtocolCommand::Disconnect)
                .with_name(attempt.name.as_str());
            self.send_to(&attempt, &attempt.broker, RouteId::PARENT, &goodbye);
        }
        if ctx.rx_status() == ConnectionStatus::Error {
            ctx.set_tx_status(ConnectionStatus::Error);
        } else {
            ctx.close_tx();
        }
        debug!(endpoint = %attempt.name, "transmitter stopped");
        queue
    }
}

impl CommsBinding for InprocBinding {
    fn kind(&self) -> &'static str {
        "inproc"
    }

    fn prepare(&self, config: &CommsConfig) -> Result<(), TransportError> {
        if config.name.is_empty() {
            return Err(TransportError::Config(
                "in-process endpoints need a name".into(),
            ));
        }
        let inbox = self.hub.register(&config.name)?;
        info!(endpoint = %config.name, broker = %config.broker_target, "registered on hub");
        *self.attempt.lock() = Some(Arc::new(InprocAttempt {
            name: config.name.clone(),
            broker: config.broker_target.clone(),
            max_body: config.max_message_size,
            inbox: Mutex::new(Some(inbox)),
            close_rx: Notify::new(),
        }));
        Ok(())
    }

    fn receive_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.run_receiver(ctx)
    }

    fn transmit_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
        queue: QueueReceiver,
    ) -> impl std::future::Future<Output = QueueReceiver> + Send + 'static {
        self.run_transmitter(ctx, queue)
    }

    fn close_receiver(&self) {
        if let Some(attempt) = self.current() {
            // Stores a permit if the loop is not waiting yet.
            attempt.close_rx.notify_one();
        }
    }

    fn address(&self) -> Option<String> {
        self.current().map(|attempt| attempt.name.clone())
    }
}
