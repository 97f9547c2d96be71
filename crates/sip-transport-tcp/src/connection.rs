//! A single pooled TCP connection: write half plus the shared stream-framer
//! state (spec §3, §4.2).

use sip_core::{ConnectionId, EndPoint, StreamConnection, StreamDirection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

/// `remote`/`connection_id` are duplicated out of the [`StreamConnection`]
/// so the pool's secondary lookup (`find` by end-point) can run as a plain
/// synchronous predicate instead of awaiting a lock.
pub struct PooledConnection {
    pub connection_id: ConnectionId,
    pub remote: EndPoint,
    pub direction: StreamDirection,
    write_half: AsyncMutex<OwnedWriteHalf>,
    state: StdMutex<StreamConnection>,
    shutting_down: AtomicBool,
}

impl PooledConnection {
    pub fn new(
        connection_id: ConnectionId,
        direction: StreamDirection,
        remote: EndPoint,
        write_half: OwnedWriteHalf,
    ) -> Self {
        Self {
            connection_id: connection_id.clone(),
            remote: remote.clone(),
            direction,
            write_half: AsyncMutex::new(write_half),
            state: StdMutex::new(StreamConnection::new(connection_id, direction, remote)),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut half = self.write_half.lock().await;
        half.write_all(bytes).await?;
        self.touch();
        Ok(())
    }

    pub fn touch(&self) {
        self.state.lock().unwrap().touch();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().unwrap().idle_for()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.state.lock().unwrap().append(bytes);
    }

    pub fn extract_messages(&self, framer: &dyn sip_core::MessageFramer) -> Result<Vec<Vec<u8>>, ()> {
        self.state.lock().unwrap().extract_messages(framer)
    }

    /// Marks the connection as already being torn down so a racing pruner
    /// and an explicit close don't both try to shut the socket down.
    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub async fn shutdown(&self) {
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }
}
