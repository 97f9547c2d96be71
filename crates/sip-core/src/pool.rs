//! Per-channel connection pool: `connection_id -> stream_connection` (spec §3).
//!
//! Shared by `sip-transport-tcp`, `sip-transport-tls`, and the WebSocket
//! client channel. A secondary lookup by remote end-point or server URI is
//! a linear scan over the map's values — acceptable given the pool is
//! capped at `max_stream_connections` (1000 by default).

use crate::ids::ConnectionId;
use dashmap::DashMap;
use std::sync::Arc;

pub struct ConnectionPool<C> {
    entries: DashMap<ConnectionId, Arc<C>>,
    max_connections: usize,
}

impl<C> ConnectionPool<C> {
    pub fn new(max_connections: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_connections,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_connections
    }

    /// Inserts a new pooled connection. Returns `false` without replacing
    /// the existing entry if `id` is already present — insert/remove are
    /// meant to behave CAS-style so a racing accept/connect never clobbers
    /// a connection another task already registered under the same id.
    pub fn insert(&self, id: ConnectionId, conn: Arc<C>) -> bool {
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conn);
                true
            }
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<C>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<C>> {
        self.entries.remove(id).map(|(_, conn)| conn)
    }

    /// Linear scan for the first entry satisfying `predicate` — the
    /// secondary lookup by remote end-point or server URI.
    pub fn find(&self, predicate: impl Fn(&C) -> bool) -> Option<Arc<C>> {
        self.entries
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn any(&self, predicate: impl Fn(&C) -> bool) -> bool {
        self.find(predicate).is_some()
    }

    /// Removes and returns every connection satisfying `predicate` — used
    /// by the idle pruner to sweep stale connections in one pass.
    pub fn drain_matching(&self, predicate: impl Fn(&C) -> bool) -> Vec<Arc<C>> {
        let ids: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        ids.into_iter().filter_map(|id| self.remove(&id)).collect()
    }

    pub fn values(&self) -> Vec<Arc<C>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_cas_style() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(10);
        let id = ConnectionId::from_string("a");
        assert!(pool.insert(id.clone(), Arc::new(1)));
        assert!(!pool.insert(id.clone(), Arc::new(2)));
        assert_eq!(*pool.get(&id).unwrap(), 1);
    }

    #[test]
    fn drain_matching_removes_and_returns() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(10);
        pool.insert(ConnectionId::from_string("a"), Arc::new(1));
        pool.insert(ConnectionId::from_string("b"), Arc::new(2));
        let drained = pool.drain_matching(|v| *v == 1);
        assert_eq!(drained.len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn is_full_respects_max_connections() {
        let pool: ConnectionPool<u32> = ConnectionPool::new(1);
        pool.insert(ConnectionId::from_string("a"), Arc::new(1));
        assert!(pool.is_full());
    }
}
