//! Failed-destination tracking (spec §3 "Failed-destination set", §4.3).
//!
//! UDP has no connection to fail, so the only durable signal that a
//! destination is unreachable is an ICMP rejection surfacing as
//! `ConnectionRefused` on a later `recv`. Once observed, the destination is
//! remembered for a short TTL so a burst of sends to the same dead peer
//! fails fast instead of hitting the network each time.

use dashmap::DashMap;
use sip_core::EndPoint;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn monotonic_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

fn now_millis() -> u64 {
    monotonic_base().elapsed().as_millis() as u64
}

pub struct FailedDestinations {
    entries: DashMap<EndPoint, u64>,
    ttl: Duration,
}

impl FailedDestinations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Marks `destination` as failed as of now.
    pub fn insert(&self, destination: EndPoint) {
        self.entries.insert(destination, now_millis());
    }

    /// Reports whether `destination` failed within the TTL window.
    pub fn is_active(&self, destination: &EndPoint) -> bool {
        match self.entries.get(destination) {
            Some(recorded_at) => now_millis().saturating_sub(*recorded_at) < self.ttl.as_millis() as u64,
            None => false,
        }
    }

    /// Drops every entry older than the TTL. Called by the periodic expiry task.
    pub fn expire(&self) {
        let ttl_millis = self.ttl.as_millis() as u64;
        let now = now_millis();
        self.entries
            .retain(|_, recorded_at| now.saturating_sub(*recorded_at) < ttl_millis);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_core::Protocol;

    fn ep(port: u16) -> EndPoint {
        EndPoint::new(Protocol::Udp, "127.0.0.1".parse().unwrap(), port)
    }

    #[test]
    fn fresh_entry_is_active() {
        let set = FailedDestinations::new(Duration::from_secs(30));
        set.insert(ep(1));
        assert!(set.is_active(&ep(1)));
    }

    #[test]
    fn unknown_destination_is_not_active() {
        let set = FailedDestinations::new(Duration::from_secs(30));
        assert!(!set.is_active(&ep(2)));
    }

    #[test]
    fn expire_drops_entries_past_ttl() {
        let set = FailedDestinations::new(Duration::from_millis(0));
        set.insert(ep(3));
        std::thread::sleep(Duration::from_millis(5));
        set.expire();
        assert!(set.is_empty());
    }
}
