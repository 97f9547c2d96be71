//! Process-unique channel and connection identifiers (spec §3 "Channel identity").

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A channel's stable, process-unique identity: an ASCII decimal string
/// backed by a monotonically increasing counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(Arc<str>);

impl ChannelId {
    fn from_counter(value: u64) -> Self {
        Self(Arc::from(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process-wide counter handing out [`ChannelId`]s. One instance is shared
/// by every channel constructor via [`ChannelIdGenerator::global`].
#[derive(Debug)]
pub struct ChannelIdGenerator {
    next: AtomicU64,
}

impl ChannelIdGenerator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ChannelId {
        ChannelId::from_counter(self.next.fetch_add(1, Ordering::Relaxed))
    }

    pub fn global() -> &'static ChannelIdGenerator {
        static GENERATOR: ChannelIdGenerator = ChannelIdGenerator::new();
        &GENERATOR
    }
}

impl Default for ChannelIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream connection's identity, opaque to the host, unique within the
/// owning channel's pool for the connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(Arc::from(value.into()))
    }

    /// A random hex-encoded id, used by the accept/connect paths for
    /// stream-oriented channels.
    pub fn random() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // A CSPRNG would be overkill here: connection ids are not a
        // security boundary, only a routing hint, so a counter mixed with
        // wall-clock jitter is sufficient to avoid collisions in one process.
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self::from_string(format!("{:016x}{:08x}", nanos, counter))
    }

    /// Deterministic id derived from a hash of a server URI, used by the
    /// WebSocket client channel's egress connection key (spec §4.7).
    pub fn from_uri_hash(uri: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        uri.hash(&mut hasher);
        Self::from_string(format!("{:016x}", hasher.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
