//! The route table: logical route ids → transport targets.
//!
//! Written by `add_route` from any thread, read by the transmitter loop.
//! Lookups never fail: an id with no entry resolves to the parent route,
//! so a node can always reach any other node through its broker before
//! direct routes are known.

use std::collections::HashMap;

use parking_lot::RwLock;
use simbus_protocol::RouteId;

/// One route table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Transport-specific target, e.g. `"host:port"` or a peer name.
    pub target: String,
    /// Increases on every insert, so a cached connection can tell that its
    /// route was overwritten.
    pub revision: u64,
}

/// Where the transmitter should send a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The broker connection, either requested or as the fallback.
    Parent,
    /// A comms-internal instruction.
    Control,
    /// A route added with `add_route`.
    Direct(RouteEntry),
}

#[derive(Debug, Default)]
struct RouteMap {
    entries: HashMap<RouteId, RouteEntry>,
    next_revision: u64,
}

/// Thread-safe map from [`RouteId`] to [`RouteEntry`].
#[derive(Debug, Default)]
pub struct RouteTable {
    inner: RwLock<RouteMap>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites a route. Returns the previous entry.
    pub fn insert(&self, id: RouteId, target: impl Into<String>) -> Option<RouteEntry> {
        let mut map = self.inner.write();
        map.next_revision += 1;
        let entry = RouteEntry {
            target: target.into(),
            revision: map.next_revision,
        };
        map.entries.insert(id, entry)
    }

    pub fn remove(&self, id: RouteId) -> Option<RouteEntry> {
        self.inner.write().entries.remove(&id)
    }

    pub fn get(&self, id: RouteId) -> Option<RouteEntry> {
        self.inner.read().entries.get(&id).cloned()
    }

    pub fn contains(&self, id: RouteId) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All route ids, sorted.
    pub fn ids(&self) -> Vec<RouteId> {
        let mut ids: Vec<_> = self.inner.read().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Decides where a message for `id` goes.
    pub fn resolve(&self, id: RouteId) -> Resolution {
        if id.is_control() {
            return Resolution::Control;
        }
        if id.is_parent() {
            return Resolution::Parent;
        }
        match self.get(id) {
            Some(entry) => Resolution::Direct(entry),
            None => Resolution::Parent,
        }
    }
}
