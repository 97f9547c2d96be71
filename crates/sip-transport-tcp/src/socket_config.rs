//! Socket-level tuning applied to every accepted or dialed stream (spec §4.4).
//!
//! `Linger(on=true, timeout=0)` makes `close()` send a TCP RST instead of the
//! usual FIN-ACK exchange, which avoids piling up `TIME_WAIT` sockets on a
//! channel that opens and closes many short-lived connections. Linux honours
//! the RST but, unlike Windows, still lets the port be reused immediately
//! either way — implementers on that platform get the RST behaviour without
//! the `TIME_WAIT` problem it exists to dodge.

use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

/// `linger = Some(Duration::ZERO)` is the spec's Linger-0 default; set to
/// `None` to fall back to the platform's ordinary close behaviour.
#[derive(Debug, Clone, Copy)]
pub struct TcpSocketConfig {
    linger: Option<Duration>,
}

impl TcpSocketConfig {
    pub fn new() -> Self {
        Self {
            linger: Some(Duration::ZERO),
        }
    }

    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_linger(self.linger)
    }
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}
