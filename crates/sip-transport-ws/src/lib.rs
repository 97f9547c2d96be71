//! WebSocket server and client channels (spec components C6/C7, §4.6-§4.7).
//!
//! The server channel accepts HTTP `Upgrade: websocket` connections and
//! treats one WebSocket message as one SIP message — no stream framing.
//! The client channel is outbound-only, keyed by a hash of the peer's
//! server URI, and routes received bytes through the same stream-framer
//! C4/C5 use since WebSocket frame boundaries aren't trusted to align with
//! SIP message boundaries on that path.

mod client;
mod duplex;
mod server;

pub use client::{PooledConnection as ClientPooledConnection, WsClientChannel};
pub use server::{PooledConnection as ServerPooledConnection, WsServerChannel};
