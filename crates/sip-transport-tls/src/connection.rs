//! A single pooled TLS connection (spec §3, §4.5): same bookkeeping as the
//! plain-TCP channel's pooled connection, but the read/write halves come
//! from a `tokio_rustls` stream rather than a bare socket.

use sip_core::{ConnectionId, EndPoint, StreamConnection, StreamDirection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PooledConnection {
    pub connection_id: ConnectionId,
    pub remote: EndPoint,
    pub direction: StreamDirection,
    write_half: AsyncMutex<BoxedWrite>,
    state: StdMutex<StreamConnection>,
    shutting_down: AtomicBool,
}

impl PooledConnection {
    pub fn new(
        connection_id: ConnectionId,
        direction: StreamDirection,
        remote: EndPoint,
        write_half: BoxedWrite,
    ) -> Self {
        Self {
            connection_id: connection_id.clone(),
            remote: remote.clone(),
            direction,
            write_half: AsyncMutex::new(write_half),
            state: StdMutex::new(StreamConnection::with_capacity(
                connection_id,
                direction,
                remote,
                sip_core::DEFAULT_STREAM_BUFFER_BYTES,
            )),
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

    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub async fn shutdown(&self) {
        let mut half = self.write_half.lock().await;
        let _ = half.shutdown().await;
    }
}
