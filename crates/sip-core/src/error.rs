//! The stable error taxonomy surfaced across every transport (spec §7).
//!
//! Errors never cross a task boundary as a panic or a thrown exception;
//! every fallible operation returns one tagged [`SendError`] variant. IO
//! failures are folded into [`SendError::Fault`] via [`map_io_error`], which
//! mirrors the `OperationKind` + stable-code idiom used throughout the
//! transport crates.

use std::fmt;
use std::io;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, SendError>;

/// A stable (code, human description) pair identifying which operation
/// failed, independent of the underlying I/O error.
#[derive(Clone, Copy)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

pub const BIND: OperationKind = OperationKind::new("sip.transport.bind_failed", "bind");
pub const ACCEPT: OperationKind = OperationKind::new("sip.transport.accept_failed", "accept");
pub const CONNECT: OperationKind = OperationKind::new("sip.transport.connect_failed", "connect");
pub const SEND: OperationKind = OperationKind::new("sip.transport.send_failed", "send");
pub const RECEIVE: OperationKind = OperationKind::new("sip.transport.receive_failed", "receive");
pub const HANDSHAKE: OperationKind = OperationKind::new("sip.transport.handshake_failed", "tls handshake");
pub const CLOSE: OperationKind = OperationKind::new("sip.transport.close_failed", "close");

/// Taxonomy from spec §7. `Success` has no variant here: a successful
/// operation is represented by `Ok(())`, not by a tag.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("bind failed: {0}")]
    BindError(#[source] io::Error),

    #[error("no live connection to destination and may_connect=false")]
    NotConnected,

    #[error("destination refused the connection")]
    ConnectionRefused,

    #[error("operation on {operation} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        after: Duration,
    },

    #[error("TLS handshake completed but the remote peer was not authenticated")]
    ProtocolNotSupported,

    #[error("channel is closing or already closed")]
    Disconnecting,

    #[error("{operation}: {source}")]
    Fault {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("operation not implemented for this transport variant")]
    NotImplemented,
}

impl SendError {
    pub fn timed_out(kind: OperationKind, after: Duration) -> Self {
        SendError::TimedOut {
            operation: kind.message,
            after,
        }
    }

    pub fn fault(kind: OperationKind, source: io::Error) -> Self {
        SendError::Fault {
            operation: kind.message,
            source,
        }
    }
}

/// Maps a raw I/O failure onto the taxonomy, classifying connection-reset
/// style errors as [`SendError::ConnectionRefused`] rather than a bare fault.
pub fn map_io_error(kind: OperationKind, error: io::Error) -> SendError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => SendError::ConnectionRefused,
        io::ErrorKind::TimedOut => SendError::timed_out(kind, Duration::ZERO),
        _ => SendError::fault(kind, error),
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationKind")
            .field("code", &self.code)
            .field("message", &self.message)
            .finish()
    }
}
