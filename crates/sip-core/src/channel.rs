//! The polymorphic `Channel` trait (spec §4, REDESIGN FLAGS).
//!
//! The source material represents the four transport variants as a base
//! class with virtual methods and mutable event-subscriber fields; here
//! that collapses to one object-safe trait plus a single injected
//! [`MessageSink`] callback. Shared bind-address/protocol/id state lives in
//! each implementor's own fields (composition), not in a shared base.

use crate::endpoint::{EndPoint, Protocol};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// The callback a host (the SIP transaction layer) registers to receive
/// complete SIP messages. One sink is injected per channel at construction;
/// if a host genuinely needs multiple listeners it should fan out from
/// inside its own `on_message`, not register several sinks on one channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn on_message(&self, channel_id: &str, local: EndPoint, remote: EndPoint, bytes: Bytes);
}

/// Operations common to every transport variant (spec §6).
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send_async(
        &self,
        dst_ep: &EndPoint,
        bytes: Bytes,
        may_connect: bool,
        connection_hint: Option<&str>,
    ) -> Result<()>;

    /// TLS and WSS override this; every other variant returns
    /// `NotImplemented` by default rather than requiring a trivial
    /// implementation in crates that have no secure variant.
    async fn send_secure_async(
        &self,
        _dst_ep: &EndPoint,
        _bytes: Bytes,
        _expected_server_name: &str,
        _may_connect: bool,
        _connection_hint: Option<&str>,
    ) -> Result<()> {
        Err(crate::error::SendError::NotImplemented)
    }

    fn has_connection_by_id(&self, connection_id: &str) -> bool;
    fn has_connection_by_endpoint(&self, endpoint: &EndPoint) -> bool;

    /// Only the WebSocket client channel keys connections by server URI;
    /// every other variant reports `false`.
    fn has_connection_by_uri(&self, _uri: &str) -> bool {
        false
    }

    fn supports_address_family(&self, family: AddressFamily) -> bool;
    fn supports_protocol(&self, protocol: Protocol) -> bool;
    fn listening_endpoint(&self) -> EndPoint;

    /// Selects the correct local address for a contact header when bound
    /// on a wildcard address.
    fn contact_uri_for(&self, destination: &EndPoint) -> String;

    async fn close(&self);
}
