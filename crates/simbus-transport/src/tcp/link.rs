//! Live TCP connections and the registry that tracks them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use simbus_protocol::{ActionMessage, Deframer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::TransportError;

/// Counter for generating unique link ids.
static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for one TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LinkId(u64);

impl LinkId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// How a connection came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkRole {
    /// Dialed by us to the broker.
    Parent,
    /// Accepted by our listener.
    Accepted,
    /// Dialed by us for a direct route.
    Dialed,
}

/// The writing half of a connection. Reading happens on a separate pump
/// task that feeds the receiver loop.
#[derive(Debug)]
pub(crate) struct Link {
    pub id: LinkId,
    pub role: LinkRole,
    pub peer: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl Link {
    pub(crate) fn new(role: LinkRole, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self {
            id: LinkId::next(),
            role,
            peer,
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Writes one whole frame. Frames from concurrent callers never
    /// interleave.
    pub(crate) async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .write_all(frame)
            .await
            .map_err(TransportError::SendFailed)
    }

    pub(crate) async fn send_message(&self, msg: &ActionMessage) -> Result<(), TransportError> {
        let frame = msg.packetize()?;
        self.send(&frame).await
    }

    /// Half-closes the connection so the peer's reader sees end of stream.
    pub(crate) async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            trace!(link = %self.id, error = %e, "shutdown failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Reader pump
// ---------------------------------------------------------------------------

/// What a reader pump reports to the receiver loop.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message { link: LinkId, msg: ActionMessage },
    Closed { link: LinkId },
    Failed { link: LinkId, error: TransportError },
}

/// Spawns a task that deframes everything read from `reader` into
/// `events` until the stream ends.
pub(crate) fn spawn_reader(
    link: LinkId,
    mut reader: OwnedReadHalf,
    max_body: usize,
    events: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deframer = Deframer::new(max_body);
        loop {
            match reader.read_buf(deframer.buffer_mut()).await {
                Ok(0) => {
                    let _ = events.send(Inbound::Closed { link });
                    return;
                }
                Ok(n) => {
                    trace!(%link, bytes = n, "read");
                    loop {
                        match deframer.next_message() {
                            Ok(Some(msg)) => {
                                if events.send(Inbound::Message { link, msg }).is_err() {
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => warn!(%link, error = %e, "dropping corrupt frame"),
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(Inbound::Failed {
                        link,
                        error: TransportError::ReceiveFailed(e),
                    });
                    return;
                }
            }
        }
    })
}

/// Opens a TCP connection to `target`, giving up after `timeout`.
pub(crate) async fn dial(
    target: &str,
    timeout: Duration,
    nodelay: bool,
) -> Result<TcpStream, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(TransportError::ConnectFailed {
                target: target.to_string(),
                source,
            });
        }
        Err(_) => return Err(TransportError::Timeout(timeout)),
    };
    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target, error = %e, "cannot disable nagle");
        }
    }
    Ok(stream)
}

/// Returns `true` if `target` looks like `host:port` rather than a peer
/// name.
pub(crate) fn has_port(target: &str) -> bool {
    target
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LinkMap {
    links: HashMap<LinkId, Arc<Link>>,
    /// Peer names learned from registration handshakes.
    names: HashMap<String, LinkId>,
    /// `host:port` targets we dialed for direct routes.
    dialed: HashMap<String, LinkId>,
    parent: Option<LinkId>,
}

/// Every open link of one connection attempt, indexed by id, peer name,
/// and dialed target.
#[derive(Debug, Default)]
pub(crate) struct LinkRegistry {
    inner: Mutex<LinkMap>,
}

impl LinkRegistry {
    pub(crate) fn insert(&self, link: Arc<Link>) {
        let mut map = self.inner.lock();
        if link.role == LinkRole::Parent {
            map.parent = Some(link.id);
        }
        map.links.insert(link.id, link);
    }

    pub(crate) fn get(&self, id: LinkId) -> Option<Arc<Link>> {
        self.inner.lock().links.get(&id).cloned()
    }

    pub(crate) fn parent(&self) -> Option<Arc<Link>> {
        let map = self.inner.lock();
        map.parent.and_then(|id| map.links.get(&id).cloned())
    }

    pub(crate) fn is_parent(&self, id: LinkId) -> bool {
        self.inner.lock().parent == Some(id)
    }

    /// Associates a peer name with a link. A later registration under the
    /// same name replaces the earlier one.
    pub(crate) fn register_name(&self, name: &str, id: LinkId) {
        if name.is_empty() {
            return;
        }
        let mut map = self.inner.lock();
        if map.links.contains_key(&id) {
            map.names.insert(name.to_string(), id);
        }
    }

    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<Link>> {
        let map = self.inner.lock();
        map.names.get(name).and_then(|id| map.links.get(id).cloned())
    }

    pub(crate) fn set_dialed(&self, target: &str, id: LinkId) {
        self.inner.lock().dialed.insert(target.to_string(), id);
    }

    pub(crate) fn dialed(&self, target: &str) -> Option<Arc<Link>> {
        let map = self.inner.lock();
        map.dialed.get(target).and_then(|id| map.links.get(id).cloned())
    }

    /// Forgets a link and every index entry pointing at it.
    pub(crate) fn remove(&self, id: LinkId) -> Option<Arc<Link>> {
        let mut map = self.inner.lock();
        let link = map.links.remove(&id)?;
        map.names.retain(|_, v| *v != id);
        map.dialed.retain(|_, v| *v != id);
        if map.parent == Some(id) {
            map.parent = None;
        }
        Some(link)
    }

    /// Removes and returns every link.
    pub(crate) fn drain(&self) -> Vec<Arc<Link>> {
        let mut map = self.inner.lock();
        map.names.clear();
        map.dialed.clear();
        map.parent = None;
        map.links.drain().map(|(_, link)| link).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().links.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn link_pair(role: LinkRole) -> (Arc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = client.into_split();
        (Arc::new(Link::new(role, addr, write)), server)
    }

    #[test]
    fn test_link_id_display() {
        let id = LinkId::next();
        assert!(id.to_string().starts_with("link-"));
        assert_ne!(LinkId::next(), id);
    }

    #[test]
    fn test_has_port() {
        assert!(has_port("localhost:24160"));
        assert!(has_port("127.0.0.1:0"));
        assert!(!has_port("core1"));
        assert!(!has_port("localhost:http"));
        assert!(!has_port(":80"));
    }

    #[tokio::test]
    async fn test_registry_indexes() {
        let registry = LinkRegistry::default();
        let (parent, _p) = link_pair(LinkRole::Parent).await;
        let (dialed, _d) = link_pair(LinkRole::Dialed).await;
        registry.insert(Arc::clone(&parent));
        registry.insert(Arc::clone(&dialed));
        registry.register_name("broker", parent.id);
        registry.set_dialed("127.0.0.1:9", dialed.id);

        assert!(registry.is_parent(parent.id));
        assert_eq!(registry.parent().unwrap().id, parent.id);
        assert_eq!(registry.by_name("broker").unwrap().id, parent.id);
        assert_eq!(registry.dialed("127.0.0.1:9").unwrap().id, dialed.id);
        assert_eq!(registry.len(), 2);

        registry.remove(parent.id);
        assert!(registry.parent().is_none());
        assert!(registry.by_name("broker").is_none());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.dialed("127.0.0.1:9").is_none());
    }

    #[tokio::test]
    async fn test_register_name_ignores_unknown_link() {
        let registry = LinkRegistry::default();
        registry.register_name("ghost", LinkId::next());
        assert!(registry.by_name("ghost").is_none());
    }

    #[tokio::test]
    async fn test_reader_pump_reports_messages_then_close() {
        let (link, server) = link_pair(LinkRole::Dialed).await;
        let (read, _write) = server.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let reader_id = LinkId::next();
        let handle = spawn_reader(reader_id, read, 1024, tx);

        let msg = ActionMessage::new(simbus_protocol::Action::Ack).with_name("core1");
        link.send_message(&msg).await.unwrap();
        link.shutdown().await;

        match rx.recv().await.unwrap() {
            Inbound::Message { link, msg: got } => {
                assert_eq!(link, reader_id);
                assert_eq!(got, msg);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), Inbound::Closed { .. }));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = dial(&addr, Duration::from_secs(2), true).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
