//! The comms interface: the transport-agnostic half of every comms
//! instance.
//!
//! [`Comms`] owns the route table, the two status flags, the transmit
//! queue, and the inbound callback. It starts exactly one receiver loop
//! and one transmitter loop per connection attempt, both supplied by a
//! [`CommsBinding`], and supervises them until `disconnect`.
//!
//! ```text
//! producer ──transmit──→ TransmitQueue ──→ transmitter loop ──→ wire
//!                                                                 │
//! callback ←──dispatch── receiver loop ←──────── deframe ←────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use simbus_protocol::{ActionMessage, ProtocolCommand, RouteId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::queue::{QueueReceiver, TransmitQueue, transmit_queue};
use crate::{CommsBinding, CommsConfig, ConnectionStatus, RouteTable, StatusFlag};

/// Handler for inbound messages. Invoked on the receiver loop, so it
/// should hand long work off rather than block.
pub type ActionCallback = Arc<dyn Fn(ActionMessage) + Send + Sync>;

// ---------------------------------------------------------------------------
// CommsContext
// ---------------------------------------------------------------------------

/// State shared between the public API and the two loops.
pub struct CommsContext {
    rx_status: StatusFlag,
    tx_status: StatusFlag,
    status_changed: Notify,
    routes: RouteTable,
    callback: RwLock<Option<ActionCallback>>,
    queue: RwLock<TransmitQueue>,
    config: RwLock<CommsConfig>,
    attempt: std::sync::atomic::AtomicU32,
}

impl CommsContext {
    fn new(config: CommsConfig, queue: TransmitQueue) -> Self {
        Self {
            rx_status: StatusFlag::new(),
            tx_status: StatusFlag::new(),
            status_changed: Notify::new(),
            routes: RouteTable::new(),
            callback: RwLock::new(None),
            queue: RwLock::new(queue),
            config: RwLock::new(config),
            attempt: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn rx_status(&self) -> ConnectionStatus {
        self.rx_status.get()
    }

    pub fn tx_status(&self) -> ConnectionStatus {
        self.tx_status.get()
    }

    /// Moves the receive side to `status` and wakes anyone waiting on a
    /// status change.
    pub fn set_rx_status(&self, status: ConnectionStatus) {
        if self.rx_status.transition(status) {
            trace!(%status, "receiver status changed");
            self.status_changed.notify_waiters();
        }
    }

    pub fn set_tx_status(&self, status: ConnectionStatus) {
        if self.tx_status.transition(status) {
            trace!(%status, "transmitter status changed");
            self.status_changed.notify_waiters();
        }
    }

    /// Normal receiver exit. Keeps an `Error` status in place.
    pub fn close_rx(&self) {
        if self.rx_status.close() {
            self.status_changed.notify_waiters();
        }
    }

    /// Normal transmitter exit. Keeps an `Error` status in place.
    pub fn close_tx(&self) {
        if self.tx_status.close() {
            self.status_changed.notify_waiters();
        }
    }

    /// Resolves once `done` returns `true`, re-checking after every status
    /// change.
    pub async fn wait_until(&self, done: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.status_changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change in between is not missed.
            notified.as_mut().enable();
            if done(self) {
                return;
            }
            notified.await;
        }
    }

    /// Resolves once the receive side has stopped.
    pub async fn receiver_stopped(&self) {
        self.wait_until(|ctx| ctx.rx_status().is_finished()).await
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> CommsConfig {
        self.config.read().clone()
    }

    pub fn queue(&self) -> TransmitQueue {
        self.queue.read().clone()
    }

    /// Number of the current connection attempt, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Hands an inbound message to the registered callback. Without a
    /// callback the message is dropped.
    pub fn dispatch(&self, msg: ActionMessage) {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(msg),
            None => {
                debug!(action = %msg.action, "no callback registered, dropping message");
            }
        }
    }

    /// The message the default close hook enqueues for the given attempt.
    pub fn close_instruction(attempt: u32) -> ActionMessage {
        let mut msg = ActionMessage::protocol(ProtocolCommand::Disconnect);
        msg.dest_handle = attempt as i32;
        msg
    }

    /// Returns `true` if `msg` is the close instruction for `attempt`.
    /// Instructions left over from an earlier attempt do not match.
    pub fn is_close_instruction(msg: &ActionMessage, attempt: u32) -> bool {
        msg.is_protocol(ProtocolCommand::Disconnect) && msg.dest_handle == attempt as i32
    }
}

/// Packetizes `msg` for the wire, or logs and returns `None` if it cannot
/// be encoded or exceeds `max_body`.
pub(crate) fn wire_frame(msg: &ActionMessage, route: RouteId, max_body: usize) -> Option<Vec<u8>> {
    let body_len = msg.encoded_len();
    if body_len > max_body {
        warn!(%route, action = %msg.action, body_len, max_body, "message too large, dropping");
        return None;
    }
    match msg.packetize() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(%route, action = %msg.action, error = %e, "message cannot be encoded, dropping");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Comms
// ---------------------------------------------------------------------------

struct Loops {
    receiver: JoinHandle<()>,
    transmitter: JoinHandle<QueueReceiver>,
}

/// A comms instance bound to one transport.
///
/// All methods take `&self`; an instance can be shared behind an `Arc` and
/// driven from several threads. Only [`connect`](Self::connect) and
/// [`disconnect`](Self::disconnect) wait on I/O.
pub struct Comms<B: CommsBinding> {
    binding: Arc<B>,
    context: Arc<CommsContext>,
    /// The queue's receiving half while no transmitter loop holds it.
    idle_queue: Mutex<Option<QueueReceiver>>,
    /// Running loops; the async lock also serialises connect/disconnect.
    loops: tokio::sync::Mutex<Option<Loops>>,
}

impl<B: CommsBinding> Comms<B> {
    pub fn new(binding: B) -> Self {
        Self::with_config(binding, CommsConfig::default())
    }

    pub fn with_config(binding: B, config: CommsConfig) -> Self {
        let (queue, receiver) = transmit_queue();
        Self {
            binding: Arc::new(binding),
            context: Arc::new(CommsContext::new(config, queue)),
            idle_queue: Mutex::new(Some(receiver)),
            loops: tokio::sync::Mutex::new(None),
        }
    }

    pub fn binding(&self) -> &B {
        &self.binding
    }

    pub fn context(&self) -> &Arc<CommsContext> {
        &self.context
    }

    // -- Producer side --

    /// Queues `msg` for delivery on `route`. Never blocks on I/O and never
    /// reports failure; delivery problems show up only in the logs and the
    /// connection status. A terminated instance drops everything.
    pub fn transmit(&self, route: RouteId, msg: impl Into<ActionMessage>) {
        let msg = msg.into();
        let action = msg.action;
        if self.is_terminated() {
            trace!(%route, %action, "comms terminated, dropping message");
            return;
        }
        match self.context.queue().push(route, msg) {
            Some(depth) => {
                let limit = self.context.config.read().max_queue_depth;
                if depth == limit + 1 {
                    warn!(depth, limit, "transmit queue backlog exceeds limit");
                }
                trace!(%route, %action, depth, "queued");
            }
            None => warn!(%route, %action, "transmit queue closed, dropping message"),
        }
    }

    /// Adds or replaces a route. Visible to the transmitter no later than
    /// the next message it handles for that id.
    pub fn add_route(&self, route: RouteId, target: impl Into<String>) {
        let target = target.into();
        if route.is_reserved() {
            warn!(%route, %target, "cannot assign a reserved route id");
            return;
        }
        debug!(%route, %target, "route added");
        self.context.routes.insert(route, target);
        // Lets the transmitter set the route up before its first message.
        let marker = ActionMessage::protocol(ProtocolCommand::NewRoute).with_dest(route.0, 0);
        self.context.queue().push(RouteId::CONTROL, marker);
    }

    /// Registers the inbound message handler, replacing any previous one.
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(ActionMessage) + Send + Sync + 'static,
    {
        *self.context.callback.write() = Some(Arc::new(callback));
    }

    // -- Configuration (consulted by the next `connect`) --

    pub fn set_message_size(&self, max_message_size: usize, max_queue_depth: usize) {
        let mut config = self.context.config.write();
        config.max_message_size = max_message_size;
        config.max_queue_depth = max_queue_depth;
    }

    /// Sets the local interface and broker identifiers.
    pub fn load_target_info(&self, local_target: impl Into<String>, broker_target: impl Into<String>) {
        let mut config = self.context.config.write();
        config.local_target = local_target.into();
        config.broker_target = broker_target.into();
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.context.config.write().name = name.into();
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.context.config.write().connect_timeout_ms = timeout.as_millis() as u64;
    }

    pub fn set_config(&self, config: CommsConfig) {
        *self.context.config.write() = config;
    }

    pub fn config(&self) -> CommsConfig {
        self.context.config()
    }

    pub fn name(&self) -> String {
        self.context.config.read().name.clone()
    }

    // -- Observation --

    pub fn is_connected(&self) -> bool {
        self.context.rx_status().is_connected() && self.context.tx_status().is_connected()
    }

    /// Returns `true` once `disconnect` has run; no further traffic is
    /// accepted.
    pub fn is_terminated(&self) -> bool {
        self.context.rx_status() == ConnectionStatus::Terminated
            || self.context.tx_status() == ConnectionStatus::Terminated
    }

    pub fn rx_status(&self) -> ConnectionStatus {
        self.context.rx_status()
    }

    pub fn tx_status(&self) -> ConnectionStatus {
        self.context.tx_status()
    }

    /// Messages queued but not yet picked up by the transmitter.
    pub fn pending(&self) -> usize {
        self.context.queue().pending()
    }

    /// The address peers use to reach this instance: the binding's
    /// published address if it has one, otherwise the instance name.
    pub fn address(&self) -> String {
        self.binding.address().unwrap_or_else(|| self.name())
    }

    // -- Lifecycle --

    /// Starts both loops and waits until the binding reports success or
    /// failure, or the connect timeout elapses.
    ///
    /// Returns `true` immediately if already connected, and `false` for an
    /// instance that has been disconnected. A failed attempt leaves both
    /// statuses at `Error` and may be retried.
    pub async fn connect(&self) -> bool {
        let mut loops = self.loops.lock().await;
        let ctx = &self.context;

        if self.is_terminated() {
            warn!(kind = self.binding.kind(), "cannot reconnect a terminated comms instance");
            return false;
        }
        if loops.is_some() && self.is_connected() {
            return true;
        }
        if let Some(stale) = loops.take() {
            // One side already failed; pin both to Error so the stopping
            // loops cannot close them to Terminated.
            ctx.set_rx_status(ConnectionStatus::Error);
            ctx.set_tx_status(ConnectionStatus::Error);
            self.stop_loops(stale, ctx.config().disconnect_grace()).await;
        }

        ctx.set_rx_status(ConnectionStatus::Startup);
        ctx.set_tx_status(ConnectionStatus::Startup);
        let config = ctx.config().validated();
        ctx.attempt.fetch_add(1, std::sync::atomic::Ordering::AcqRel);

        if let Err(e) = self.binding.prepare(&config) {
            error!(kind = self.binding.kind(), error = %e, "comms setup failed");
            ctx.set_rx_status(ConnectionStatus::Error);
            ctx.set_tx_status(ConnectionStatus::Error);
            return false;
        }
        let queue = self.idle_queue.lock().take();
        let Some(queue) = queue else {
            error!("transmit queue is unavailable");
            ctx.set_rx_status(ConnectionStatus::Error);
            ctx.set_tx_status(ConnectionStatus::Error);
            return false;
        };

        info!(kind = self.binding.kind(), name = %config.name, "connecting");
        let started = Loops {
            receiver: tokio::spawn(Arc::clone(&self.binding).receive_loop(Arc::clone(ctx))),
            transmitter: tokio::spawn(
                Arc::clone(&self.binding).transmit_loop(Arc::clone(ctx), queue),
            ),
        };

        let settled = tokio::time::timeout(
            config.connect_timeout(),
            ctx.wait_until(|c| {
                let (rx, tx) = (c.rx_status(), c.tx_status());
                rx == ConnectionStatus::Error
                    || tx == ConnectionStatus::Error
                    || (!rx.is_startup() && !tx.is_startup())
            }),
        )
        .await;

        if self.is_connected() {
            info!(
                kind = self.binding.kind(),
                name = %config.name,
                address = %self.address(),
                "connected"
            );
            *loops = Some(started);
            return true;
        }

        if settled.is_err() {
            warn!(timeout = ?config.connect_timeout(), "connect timed out");
        }
        warn!(
            rx = %ctx.rx_status(),
            tx = %ctx.tx_status(),
            "connect failed"
        );
        ctx.set_rx_status(ConnectionStatus::Error);
        ctx.set_tx_status(ConnectionStatus::Error);
        self.stop_loops(started, config.disconnect_grace()).await;
        false
    }

    /// Stops both loops, waits for them, and marks the instance
    /// terminated. Safe to call repeatedly and from any thread.
    pub async fn disconnect(&self) {
        let mut loops = self.loops.lock().await;
        if let Some(running) = loops.take() {
            info!(kind = self.binding.kind(), name = %self.name(), "disconnecting");
            self.stop_loops(running, self.context.config().disconnect_grace())
                .await;
        }
        self.context.set_rx_status(ConnectionStatus::Terminated);
        self.context.set_tx_status(ConnectionStatus::Terminated);
    }

    /// Closes the transmitter first so queued messages are flushed, then
    /// the receiver. A loop that outlives `grace` is aborted.
    async fn stop_loops(&self, loops: Loops, grace: Duration) {
        let Loops {
            mut receiver,
            mut transmitter,
        } = loops;

        if !transmitter.is_finished() {
            self.binding.close_transmitter(&self.context);
        }
        match tokio::time::timeout(grace, &mut transmitter).await {
            Ok(Ok(queue)) => *self.idle_queue.lock() = Some(queue),
            Ok(Err(e)) => {
                error!(error = %e, "transmitter loop failed");
                self.replace_queue();
            }
            Err(_) => {
                warn!(?grace, "transmitter loop did not stop in time, aborting");
                transmitter.abort();
                self.replace_queue();
            }
        }

        self.binding.close_receiver();
        match tokio::time::timeout(grace, &mut receiver).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "receiver loop failed"),
            Err(_) => {
                warn!(?grace, "receiver loop did not stop in time, aborting");
                receiver.abort();
            }
        }
    }

    /// Installs a fresh queue after the old receiving half was lost with
    /// its loop. Anything still queued on the old one is dropped.
    fn replace_queue(&self) {
        let (queue, receiver) = transmit_queue();
        let lost = std::mem::replace(&mut *self.context.queue.write(), queue).pending();
        if lost > 0 {
            warn!(lost, "queued messages dropped with the transmitter loop");
        }
        *self.idle_queue.lock() = Some(receiver);
    }
}

impl<B: CommsBinding + Default> Default for Comms<B> {
    fn default() -> Self {
        Self::new(B::default())
    }
}

impl<B: CommsBinding> Drop for Comms<B> {
    fn drop(&mut self) {
        // Loops still running at this point are told to stop and left to
        // finish on their own.
        if let Some(loops) = self.loops.get_mut().take() {
            self.binding.close_transmitter(&self.context);
            self.binding.close_receiver();
            drop(loops);
        }
    }
}
