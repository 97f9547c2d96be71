//! `sip-core`: shared contracts for the SIP transport-channel subsystem.
//!
//! This crate holds the pieces every transport implementation (UDP, TCP,
//! TLS, WebSocket) and the RTP depacketisers build on: the end-point and
//! protocol-tag value types, the stable error taxonomy surfaced to callers,
//! a minimal cancellation primitive used to unwind a channel's background
//! tasks on `close()`, the process-wide channel/connection id generators,
//! the shared stream-framing state machine, and the `Channel`/`MessageSink`
//! trait pair that the transaction layer programs against.
//!
//! The crate deliberately does not pull in a runtime: everything here is
//! plain data and traits so that `sip-transport-udp`, `sip-transport-tcp`,
//! `sip-transport-tls`, and `sip-transport-ws` can each bind it to Tokio in
//! whatever shape their socket types need.

pub mod cancellation;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ids;
pub mod pool;
pub mod stream;

pub use cancellation::Cancellation;
pub use channel::{AddressFamily, Channel, MessageSink};
pub use config::ChannelConfig;
pub use endpoint::{EndPoint, Protocol};
pub use error::{OperationKind, Result, SendError, map_io_error};
pub use ids::{ChannelId, ChannelIdGenerator, ConnectionId};
pub use pool::ConnectionPool;
pub use stream::{
    FrameOutcome, MessageFramer, StreamConnection, StreamDirection, DEFAULT_STREAM_BUFFER_BYTES,
    MAX_SIP_MESSAGE_BYTES,
};
