//! The transmit queue: an unbounded, ordered hand-off from producer
//! threads to the single transmitter loop.
//!
//! Pushing never blocks and never fails while the receiving half is
//! alive. Messages pushed by one thread come out in the order that thread
//! pushed them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use simbus_protocol::{ActionMessage, RouteId};
use tokio::sync::mpsc;

/// A queued message and the route it is addressed to.
pub type Outgoing = (RouteId, ActionMessage);

/// Creates a connected sender/receiver pair.
pub fn transmit_queue() -> (TransmitQueue, QueueReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        TransmitQueue {
            sender,
            pending: Arc::clone(&pending),
        },
        QueueReceiver { receiver, pending },
    )
}

/// Producer half. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransmitQueue {
    sender: mpsc::UnboundedSender<Outgoing>,
    pending: Arc<AtomicUsize>,
}

impl TransmitQueue {
    /// Enqueues a message. Returns the queue depth including this message,
    /// or `None` if the receiving half is gone.
    pub fn push(&self, route: RouteId, msg: ActionMessage) -> Option<usize> {
        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        match self.sender.send((route, msg)) {
            Ok(()) => Some(depth),
            Err(_) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    /// Messages enqueued but not yet taken by the transmitter.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer half, owned by the transmitter loop while it runs.
#[derive(Debug)]
pub struct QueueReceiver {
    receiver: mpsc::UnboundedReceiver<Outgoing>,
    pending: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Waits for the next message. Returns `None` once every producer
    /// handle is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        let item = self.receiver.recv().await;
        if item.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Takes the next message if one is ready.
    pub fn try_recv(&mut self) -> Option<Outgoing> {
        let item = self.receiver.try_recv().ok();
        if item.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
