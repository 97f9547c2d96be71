//! End-point and protocol-tag value types (spec component C1).

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Wire transport a [`EndPoint`] is reachable on.
///
/// Determines reliability, security, and the default port a bare address
/// should resolve to when none is given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Udp,
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl Protocol {
    pub fn is_reliable(self) -> bool {
        !matches!(self, Protocol::Udp)
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Tls | Protocol::Wss)
    }

    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Tls | Protocol::Ws | Protocol::Wss)
    }

    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 5060,
            Protocol::Tls => 5061,
            Protocol::Ws => 80,
            Protocol::Wss => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Udp => "UDP",
            Protocol::Tcp => "TCP",
            Protocol::Tls => "TLS",
            Protocol::Ws => "WS",
            Protocol::Wss => "WSS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network end-point carried through the transport subsystem.
///
/// `channel_id`/`connection_id` are opaque hints that let the transaction
/// layer pin a response to the exact connection a request arrived on; they
/// play no part in equality for routing purposes — see [`EndPoint::is_socket_equal`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    pub protocol: Protocol,
    pub address: IpAddr,
    pub port: u16,
    pub channel_id: Option<String>,
    pub connection_id: Option<String>,
}

impl EndPoint {
    pub fn new(protocol: Protocol, address: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            address,
            port,
            channel_id: None,
            connection_id: None,
        }
    }

    pub fn from_socket_addr(protocol: Protocol, addr: SocketAddr) -> Self {
        Self::new(protocol, addr.ip(), addr.port())
    }

    pub fn with_channel_id(mut self, id: impl Into<String>) -> Self {
        self.channel_id = Some(id.into());
        self
    }

    pub fn with_connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// Equality ignoring `channel_id`/`connection_id`: the comparison a
    /// send-dispatch path uses to match a destination against a pooled
    /// connection's remote end-point.
    pub fn is_socket_equal(&self, other: &EndPoint) -> bool {
        self.protocol == other.protocol && self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.protocol, self.address, self.port)
    }
}
