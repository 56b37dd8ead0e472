//! Receiver loop: accepts peers in server mode and dispatches everything
//! the reader pumps deliver.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use simbus_protocol::{ActionMessage, ProtocolCommand};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

use super::link::{Inbound, LinkId, LinkRole};
use super::{TcpAttempt, TcpBinding};
use crate::{CommsContext, ConnectionStatus, TransportError};

pub(super) async fn run(binding: Arc<TcpBinding>, ctx: Arc<CommsContext>) {
    let Some(attempt) = binding.current() else {
        ctx.set_rx_status(ConnectionStatus::Error);
        return;
    };
    let inbound = attempt.inbound.lock().take();
    let Some(mut inbound) = inbound else {
        error!(name = %attempt.name(), "receiver started twice for one attempt");
        ctx.set_rx_status(ConnectionStatus::Error);
        return;
    };

    let listener = if attempt.tcp.server_mode {
        match listen(&binding, &attempt).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!(name = %attempt.name(), error = %e, "cannot listen");
                ctx.set_rx_status(ConnectionStatus::Error);
                return;
            }
        }
    } else {
        None
    };
    ctx.set_rx_status(ConnectionStatus::Connected);

    let mut accept_failures = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = attempt.close_rx.notified() => break,
            _ = ctx.wait_until(|c| c.tx_status().is_finished()) => {
                if ctx.tx_status() == ConnectionStatus::Error {
                    error!(name = %attempt.name(), "transmitter failed, stopping receiver");
                    ctx.set_rx_status(ConnectionStatus::Error);
                }
                break;
            }
            accepted = accept(listener.as_ref()) => match accepted {
                Ok((stream, peer)) => {
                    accept_failures = 0;
                    if attempt.tcp.nodelay {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "cannot disable nagle");
                        }
                    }
                    attempt.open_link(stream, peer, LinkRole::Accepted);
                }
                Err(e) => {
                    accept_failures += 1;
                    let delay = accept_backoff(accept_failures);
                    warn!(error = %e, failures = accept_failures, ?delay, "accept failed");
                    tokio::time::sleep(delay).await;
                }
            },
            event = inbound.recv() => {
                let Some(event) = event else { break };
                if !handle_event(&attempt, &ctx, event).await {
                    ctx.set_rx_status(ConnectionStatus::Error);
                    break;
                }
            }
        }
    }

    drop(listener);
    attempt.abort_readers();
    debug!(name = %attempt.name(), "receiver stopped");
    ctx.close_rx();
}

/// Binds the listening socket and publishes its address.
async fn listen(binding: &TcpBinding, attempt: &TcpAttempt) -> Result<TcpListener, TransportError> {
    let host = attempt.comms.local_target.trim();
    let host = if host.is_empty() { "localhost" } else { host };
    let addr = format!("{host}:{}", attempt.tcp.listen_port());
    let bind_failed = |source| TransportError::BindFailed {
        addr: addr.clone(),
        source,
    };

    let listener = TcpListener::bind(&addr).await.map_err(bind_failed)?;
    let port = listener.local_addr().map_err(bind_failed)?.port();
    binding.publish(host, port);
    info!(name = %attempt.name(), host, port, "listening");
    Ok(listener)
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Pause after the `failures`-th accept error in a row, doubling from
/// 10ms up to one second.
fn accept_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(7);
    Duration::from_millis(10 << shift).min(Duration::from_secs(1))
}

/// Handles one reader event. Returns `false` if the parent connection is
/// gone and the receiver has to stop.
async fn handle_event(attempt: &TcpAttempt, ctx: &CommsContext, event: Inbound) -> bool {
    match event {
        Inbound::Message { link, msg } => handle_message(attempt, ctx, link, msg).await,
        Inbound::Closed { link } => link_lost(attempt, link, None),
        Inbound::Failed { link, error } => link_lost(attempt, link, Some(error)),
    }
}

async fn handle_message(
    attempt: &TcpAttempt,
    ctx: &CommsContext,
    link: LinkId,
    msg: ActionMessage,
) -> bool {
    match msg.protocol_command() {
        Some(ProtocolCommand::ConnectionInfo) => {
            attempt.links.register_name(&msg.name, link);
            debug!(name = %attempt.name(), peer = %msg.name, %link, "peer registered");
            if let Some(conn) = attempt.links.get(link) {
                let ack = ActionMessage::protocol(ProtocolCommand::ConnectionAck)
                    .with_name(attempt.name());
                if let Err(e) = conn.send_message(&ack).await {
                    warn!(peer = %msg.name, %link, error = %e, "cannot acknowledge registration");
                }
            }
            ctx.dispatch(msg);
            true
        }
        Some(ProtocolCommand::ConnectionAck) => {
            attempt.links.register_name(&msg.name, link);
            trace!(peer = %msg.name, %link, "registration acknowledged");
            true
        }
        Some(ProtocolCommand::Disconnect) => {
            debug!(peer = %msg.name, %link, "peer said goodbye");
            let was_parent = attempt.links.is_parent(link);
            if let Some(conn) = attempt.links.remove(link) {
                conn.shutdown().await;
            }
            !was_parent || attempt.is_closing()
        }
        _ => {
            ctx.dispatch(msg);
            true
        }
    }
}

fn link_lost(attempt: &TcpAttempt, link: LinkId, error: Option<TransportError>) -> bool {
    let was_parent = attempt.links.is_parent(link);
    let Some(conn) = attempt.links.remove(link) else {
        // Already dropped by the transmitter or a goodbye.
        return true;
    };
    if was_parent && !attempt.is_closing() {
        match error {
            Some(e) => error!(%link, peer = %conn.peer, error = %e, "broker connection failed"),
            None => error!(%link, peer = %conn.peer, "broker closed the connection"),
        }
        return false;
    }
    let remaining = attempt.links.len();
    match error {
        Some(e) => debug!(%link, peer = %conn.peer, error = %e, remaining, "link failed"),
        None => debug!(%link, peer = %conn.peer, remaining, "link closed"),
    }
    true
}
