//! Stream connection bookkeeping and the stream framer (spec §3, §4.2).
//!
//! `StreamConnectionState` is the piece of a TCP/TLS/WebSocket-client
//! connection that is socket-independent: the receive accumulation buffer,
//! its `recv_start`/`recv_end` window, and the atomically-updated
//! last-transmission timestamp the pruner reads. Each transport crate wraps
//! this alongside its actual socket/TLS stream/websocket handle.

use crate::endpoint::EndPoint;
use crate::ids::ConnectionId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Safe default: larger than any single SIP message we expect, with slack
/// for a second message's worth of lookahead sitting in the same buffer.
pub const MAX_SIP_MESSAGE_BYTES: usize = 4096;
pub const DEFAULT_STREAM_BUFFER_BYTES: usize = 2 * MAX_SIP_MESSAGE_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Accepted,
    Initiated,
}

/// Outcome of handing one buffered window to the external SIP parser.
///
/// Mirrors the collaborator boundary from spec §1: `parse_sip_from_stream`
/// either returns a complete framed message, signals it needs more bytes,
/// or — on malformed framing — tells the caller the connection is no
/// longer resynchronisable and must be closed (spec §4.2, §7).
pub enum FrameOutcome {
    /// A complete message was extracted. `consumed` is the number of bytes
    /// (message bytes plus any framing slack the parser skipped) the
    /// caller should advance `recv_start` by.
    Complete { message: Vec<u8>, consumed: usize },
    /// Not enough bytes buffered yet; wait for more data.
    Incomplete,
    /// Framing is unrecoverable; the connection must be closed.
    Invalid,
}

/// The external SIP parser collaborator. `sip-codec-sip` provides the real
/// implementation; transport crates depend only on this trait so the
/// parser can be swapped (or stubbed in tests) without touching socket
/// code.
pub trait MessageFramer: Send + Sync {
    fn parse(&self, window: &[u8]) -> FrameOutcome;
}

fn monotonic_base() -> Instant {
    static BASE: OnceLock<Instant> = OnceLock::new();
    *BASE.get_or_init(Instant::now)
}

fn now_millis() -> u64 {
    Instant::now().duration_since(monotonic_base()).as_millis() as u64
}

/// Socket-independent half of a live stream connection (spec §3).
pub struct StreamConnection {
    connection_id: ConnectionId,
    direction: StreamDirection,
    remote: EndPoint,
    buffer: Vec<u8>,
    recv_start: usize,
    recv_end: usize,
    last_transmission_at_millis: AtomicU64,
}

impl StreamConnection {
    pub fn new(connection_id: ConnectionId, direction: StreamDirection, remote: EndPoint) -> Self {
        Self::with_capacity(connection_id, direction, remote, DEFAULT_STREAM_BUFFER_BYTES)
    }

    pub fn with_capacity(
        connection_id: ConnectionId,
        direction: StreamDirection,
        remote: EndPoint,
        capacity: usize,
    ) -> Self {
        Self {
            connection_id,
            direction,
            remote,
            buffer: vec![0u8; capacity],
            recv_start: 0,
            recv_end: 0,
            last_transmission_at_millis: AtomicU64::new(now_millis()),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn remote(&self) -> &EndPoint {
        &self.remote
    }

    /// Single atomic store; readers (the pruner) tolerate skew up to one
    /// prune interval, so no lock is taken here.
    pub fn touch(&self) {
        self.last_transmission_at_millis
            .store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_transmission_at_millis.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Appends freshly-received bytes to the window. If they would not fit,
    /// the pending window is discarded and indices reset to zero (spec §3
    /// invariant): the next SIP transaction is expected to retransmit
    /// rather than the framer trying to resynchronise mid-stream.
    pub fn append(&mut self, new_bytes: &[u8]) {
        if self.recv_end + new_bytes.len() > self.buffer.len() {
            self.recv_start = 0;
            self.recv_end = 0;
        }
        let end = (self.recv_end + new_bytes.len()).min(self.buffer.len());
        let copy_len = end - self.recv_end;
        self.buffer[self.recv_end..end].copy_from_slice(&new_bytes[..copy_len]);
        self.recv_end = end;
        debug_assert!(self.recv_start <= self.recv_end && self.recv_end <= self.buffer.len());
    }

    /// Runs the parser in a loop over the unprocessed window, yielding one
    /// message per successful parse (spec §4.2). Returns `Err(())` the
    /// moment the parser reports unrecoverable framing; the caller must
    /// close the connection and must not re-use this state afterwards.
    pub fn extract_messages(&mut self, framer: &dyn MessageFramer) -> Result<Vec<Vec<u8>>, ()> {
        let mut messages = Vec::new();
        loop {
            let window = &self.buffer[self.recv_start..self.recv_end];
            if window.is_empty() {
                break;
            }
            match framer.parse(window) {
                FrameOutcome::Complete { message, consumed } => {
                    messages.push(message);
                    self.recv_start += consumed.min(window.len());
                    if self.recv_start == self.recv_end {
                        self.recv_start = 0;
                        self.recv_end = 0;
                    }
                }
                FrameOutcome::Incomplete => break,
                FrameOutcome::Invalid => return Err(()),
            }
        }
        debug_assert!(self.recv_start <= self.recv_end && self.recv_end <= self.buffer.len());
        Ok(messages)
    }
}
