//! Unifies a plain accepted socket and a TLS-wrapped one under one type so
//! the server channel's accept loop can hand either to `accept_async`
//! without duplicating the rest of the handshake/pool/read-loop plumbing
//! (spec §4.6: "TLS variant is selected by presence of a server certificate
//! at construction").

use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait pulling `AsyncRead + AsyncWrite` together so a boxed trait
/// object can stand in for either a bare `TcpStream` or a
/// `tokio_rustls::server::TlsStream<TcpStream>`.
pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncDuplex for T {}

pub type BoxedDuplex = Box<dyn AsyncDuplex>;
