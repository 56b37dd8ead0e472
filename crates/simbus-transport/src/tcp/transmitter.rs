//! Transmitter loop: dials the broker, then drains the transmit queue,
//! resolving each route to a live link.

use std::sync::Arc;

use simbus_protocol::{ActionMessage, ProtocolCommand, RouteId};
use tracing::{debug, error, warn};

use super::link::{Link, LinkRole, has_port};
use super::{TcpAttempt, TcpBinding};
use crate::comms::wire_frame;
use crate::queue::QueueReceiver;
use crate::{CommsContext, ConnectionStatus, Resolution, TransportError};

pub(super) async fn run(
    binding: Arc<TcpBinding>,
    ctx: Arc<CommsContext>,
    mut queue: QueueReceiver,
) -> QueueReceiver {
    let Some(attempt) = binding.current() else {
        ctx.set_tx_status(ConnectionStatus::Error);
        return queue;
    };
    let id = ctx.attempt();

    if let Some(broker) = attempt.broker_address() {
        if let Err(e) = attempt.dial_link(&broker, LinkRole::Parent).await {
            error!(name = %attempt.name(), %broker, error = %e, "cannot reach broker");
            ctx.set_tx_status(ConnectionStatus::Error);
            return queue;
        }
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
        if route.is_control() {
            if CommsContext::is_close_instruction(&msg, id) {
                break;
            }
            if msg.is_protocol(ProtocolCommand::NewRoute) {
                prepare_route(&attempt, &ctx, RouteId(msg.dest_id)).await;
            }
            continue;
        }
        if let Err(e) = send_routed(&attempt, &ctx, route, &msg).await {
            error!(name = %attempt.name(), error = %e, "lost the broker connection");
            ctx.set_tx_status(ConnectionStatus::Error);
            break;
        }
    }

    attempt.set_closing();
    if let Some(parent) = attempt.links.parent() {
        let goodbye = ActionMessage::protocol(ProtocolCommand::Disconnect).with_name(attempt.name());
        if let Err(e) = parent.send_message(&goodbye).await {
            debug!(error = %e, "goodbye not sent");
        }
    }
    for link in attempt.links.drain() {
        link.shutdown().await;
    }

    if ctx.rx_status() == ConnectionStatus::Error {
        ctx.set_tx_status(ConnectionStatus::Error);
    } else {
        ctx.close_tx();
    }
    debug!(name = %attempt.name(), "transmitter stopped");
    queue
}

/// Writes `msg` to whatever `route` resolves to, retrying once on a
/// fresh connection if the write fails. Undeliverable messages are
/// logged and dropped; only losing the parent link for good is an error.
async fn send_routed(
    attempt: &TcpAttempt,
    ctx: &CommsContext,
    route: RouteId,
    msg: &ActionMessage,
) -> Result<(), TransportError> {
    let Some(frame) = wire_frame(msg, route, attempt.comms.max_message_size) else {
        return Ok(());
    };

    for retry in [false, true] {
        let Some(link) = resolve_link(attempt, ctx, route).await? else {
            warn!(%route, action = %msg.action, "no connection for route, dropping message");
            return Ok(());
        };
        match link.send(&frame).await {
            Ok(()) => return Ok(()),
            Err(e) if retry => {
                warn!(%route, link = %link.id, error = %e, "write failed again, dropping message");
                attempt.links.remove(link.id);
            }
            Err(e) => {
                warn!(%route, link = %link.id, error = %e, "write failed, reconnecting");
                attempt.links.remove(link.id);
            }
        }
    }
    Ok(())
}

/// Dials a freshly added address route so its first message does not
/// wait for the connection. Failures are retried on first use.
async fn prepare_route(attempt: &TcpAttempt, ctx: &CommsContext, route: RouteId) {
    let Resolution::Direct(entry) = ctx.routes().resolve(route) else {
        return;
    };
    if !has_port(&entry.target)
        || attempt.links.by_name(&entry.target).is_some()
        || attempt.links.dialed(&entry.target).is_some()
    {
        return;
    }
    if let Err(e) = attempt.dial_link(&entry.target, LinkRole::Dialed).await {
        debug!(%route, target = %entry.target, error = %e, "route not reachable yet");
    }
}

/// Finds the link for `route`: a peer registered under the route's
/// target name, a link we dialed to that target, or a new dial if the
/// target is an address. Anything else goes to the parent.
async fn resolve_link(
    attempt: &TcpAttempt,
    ctx: &CommsContext,
    route: RouteId,
) -> Result<Option<Arc<Link>>, TransportError> {
    let entry = match ctx.routes().resolve(route) {
        Resolution::Direct(entry) => entry,
        Resolution::Parent | Resolution::Control => return parent_link(attempt).await,
    };

    if let Some(link) = attempt.links.by_name(&entry.target) {
        return Ok(Some(link));
    }
    if let Some(link) = attempt.links.dialed(&entry.target) {
        return Ok(Some(link));
    }
    if has_port(&entry.target) {
        match attempt.dial_link(&entry.target, LinkRole::Dialed).await {
            Ok(link) => return Ok(Some(link)),
            Err(e) => {
                warn!(%route, target = %entry.target, error = %e, "cannot reach route target, using parent route");
            }
        }
    } else {
        debug!(%route, target = %entry.target, "route target not connected, using parent route");
    }
    parent_link(attempt).await
}

/// The current parent link, redialing the broker if it was dropped.
async fn parent_link(attempt: &TcpAttempt) -> Result<Option<Arc<Link>>, TransportError> {
    if let Some(link) = attempt.links.parent() {
        return Ok(Some(link));
    }
    match attempt.broker_address() {
        Some(broker) => attempt.dial_link(&broker, LinkRole::Parent).await.map(Some),
        None => Ok(None),
    }
}
