//! TCP binding.
//!
//! A TCP comms instance dials its broker (the parent route) and, in
//! server mode, listens for peers of its own. Each connection carries
//! packetized frames in both directions.
//!
//! ```text
//!              ┌─────────────── TcpAttempt ───────────────┐
//! listener ──→ │ accept → Link (Accepted) ─┐              │
//! dial     ──→ │ Link (Parent / Dialed) ───┼─ reader pump ─┼─→ receiver loop
//!              │ LinkRegistry ←── transmitter loop writes  │
//!              └───────────────────────────────────────────┘
//! ```
//!
//! The registration handshake: whoever dials sends a connection-info
//! message carrying its name (and a register-broker message when acting
//! as a subordinate broker); the accepting side records the name against
//! the connection and answers with a connection-ack carrying its own.

mod link;
mod receiver;
mod transmitter;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use simbus_protocol::{Action, ActionMessage, ProtocolCommand};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::queue::QueueReceiver;
use crate::{Comms, CommsBinding, CommsConfig, CommsContext, TcpConfig, TransportError};

use link::{Inbound, Link, LinkRegistry, LinkRole, dial, has_port, spawn_reader};

/// A comms instance over TCP.
pub type TcpComms = Comms<TcpBinding>;

impl TcpComms {
    /// Listen for incoming connections instead of only dialing out.
    pub fn set_server_mode(&self, server_mode: bool) {
        self.binding().config.lock().server_mode = server_mode;
    }

    /// Port to listen on in server mode. 0 picks a free port.
    pub fn set_port_number(&self, port: u16) {
        self.binding().config.lock().port = Some(port);
    }

    pub fn set_broker_port(&self, port: u16) {
        self.binding().config.lock().broker_port = port;
    }

    pub fn set_register_as_broker(&self, register: bool) {
        self.binding().config.lock().register_as_broker = register;
    }

    pub fn set_tcp_config(&self, config: TcpConfig) {
        *self.binding().config.lock() = config;
    }

    pub fn tcp_config(&self) -> TcpConfig {
        self.binding().config.lock().clone()
    }

    /// The bound listening port, once a server-mode instance has
    /// connected.
    pub fn port(&self) -> Option<u16> {
        self.binding().published.lock().as_ref().map(|p| p.port)
    }
}

#[derive(Debug, Clone)]
struct Published {
    address: String,
    port: u16,
}

/// [`CommsBinding`] over TCP streams.
#[derive(Default)]
pub struct TcpBinding {
    config: Mutex<TcpConfig>,
    attempt: Mutex<Option<Arc<TcpAttempt>>>,
    published: Mutex<Option<Published>>,
}

impl TcpBinding {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Mutex::new(config),
            ..Self::default()
        }
    }

    fn current(&self) -> Option<Arc<TcpAttempt>> {
        self.attempt.lock().clone()
    }

    fn publish(&self, host: &str, port: u16) {
        *self.published.lock() = Some(Published {
            address: format!("{host}:{port}"),
            port,
        });
    }
}

impl CommsBinding for TcpBinding {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn prepare(&self, config: &CommsConfig) -> Result<(), TransportError> {
        let tcp = self.config.lock().clone().validated();
        let previous = self.attempt.lock().take();
        if let Some(previous) = previous {
            previous.abort_readers();
        }
        *self.published.lock() = None;
        *self.attempt.lock() = Some(Arc::new(TcpAttempt::new(config.clone(), tcp)));
        Ok(())
    }

    fn receive_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        receiver::run(self, ctx)
    }

    fn transmit_loop(
        self: Arc<Self>,
        ctx: Arc<CommsContext>,
        queue: QueueReceiver,
    ) -> impl std::future::Future<Output = QueueReceiver> + Send + 'static {
        transmitter::run(self, ctx, queue)
    }

    fn close_receiver(&self) {
        if let Some(attempt) = self.current() {
            attempt.close_rx.notify_one();
        }
    }

    fn address(&self) -> Option<String> {
        self.published.lock().as_ref().map(|p| p.address.clone())
    }
}

// ---------------------------------------------------------------------------
// TcpAttempt
// ---------------------------------------------------------------------------

/// Everything belonging to one connection attempt. Both loops hold it;
/// a new attempt starts from a fresh one.
pub(crate) struct TcpAttempt {
    comms: CommsConfig,
    tcp: TcpConfig,
    links: LinkRegistry,
    events: mpsc::UnboundedSender<Inbound>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    close_rx: Notify,
    /// Set by the transmitter on its way out, so links closing after that
    /// are not failures.
    closing: AtomicBool,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpAttempt {
    fn new(comms: CommsConfig, tcp: TcpConfig) -> Self {
        let (events, inbound) = mpsc::unbounded_channel();
        Self {
            comms,
            tcp,
            links: LinkRegistry::default(),
            events,
            inbound: Mutex::new(Some(inbound)),
            close_rx: Notify::new(),
            closing: AtomicBool::new(false),
            readers: Mutex::new(Vec::new()),
        }
    }

    fn name(&self) -> &str {
        &self.comms.name
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// The broker to dial, if any. A listening instance without a broker
    /// target is a root; a dialing one defaults to the local broker.
    fn broker_address(&self) -> Option<String> {
        let target = self.comms.broker_target.trim();
        if target.is_empty() {
            if self.tcp.server_mode {
                return None;
            }
            return Some(format!("localhost:{}", self.tcp.broker_port));
        }
        if has_port(target) {
            Some(target.to_string())
        } else {
            Some(format!("{target}:{}", self.tcp.broker_port))
        }
    }

    /// Splits `stream`, registers its writer, and starts its reader pump.
    fn open_link(&self, stream: TcpStream, peer: SocketAddr, role: LinkRole) -> Arc<Link> {
        let (read, write) = stream.into_split();
        let link = Arc::new(Link::new(role, peer, write));
        self.links.insert(Arc::clone(&link));
        let pump = spawn_reader(link.id, read, self.comms.max_message_size, self.events.clone());
        let mut readers = self.readers.lock();
        readers.retain(|handle| !handle.is_finished());
        readers.push(pump);
        debug!(link = %link.id, %peer, role = ?role, "link opened");
        link
    }

    /// Dials `target` and performs the registration handshake.
    async fn dial_link(&self, target: &str, role: LinkRole) -> Result<Arc<Link>, TransportError> {
        let stream = dial(target, self.comms.connect_timeout(), self.tcp.nodelay).await?;
        let peer = stream.peer_addr().map_err(|source| TransportError::ConnectFailed {
            target: target.to_string(),
            source,
        })?;
        let link = self.open_link(stream, peer, role);

        let hello = ActionMessage::protocol(ProtocolCommand::ConnectionInfo).with_name(self.name());
        let handshake = async {
            link.send_message(&hello).await?;
            if role == LinkRole::Parent && self.tcp.register_as_broker {
                link.send_message(&ActionMessage::new(Action::RegisterBroker).with_name(self.name()))
                    .await?;
            }
            Ok::<_, TransportError>(())
        };
        if let Err(e) = handshake.await {
            self.links.remove(link.id);
            return Err(e);
        }
        if role == LinkRole::Dialed {
            self.links.set_dialed(target, link.id);
        }
        info!(name = %self.name(), %target, link = %link.id, "registered with peer");
        Ok(link)
    }

    fn abort_readers(&self) {
        for handle in self.readers.lock().drain(..) {
            handle.abort();
        }
    }
}
