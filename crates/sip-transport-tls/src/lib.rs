//! Stream-secure TLS channel (spec component C5, §4.5).
//!
//! Extends the plain-TCP channel's pool/accept/connect shape with a
//! `rustls` handshake on every accepted or dialed socket before it is
//! registered in the pool. A handshake that times out or fails never
//! reaches the pool at all — unlike a framing failure on an established
//! connection, a failed handshake has no connection identity to notify
//! the host about.

mod cert_policy;
mod connection;

pub use cert_policy::server_cert_verifier;
pub use connection::PooledConnection;

use async_trait::async_trait;
use bytes::Bytes;
use rustls_pki_types::ServerName;
use sip_core::{
    AddressFamily, Cancellation, Channel, ChannelConfig, ChannelId, ChannelIdGenerator,
    ConnectionId, ConnectionPool, EndPoint, MessageFramer, MessageSink, OperationKind, Protocol,
    Result as SipResult, SendError, StreamDirection, map_io_error,
};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

const BIND: OperationKind = OperationKind::new("sip.transport.tls.bind_failed", "tls bind");
const CONNECT: OperationKind = OperationKind::new("sip.transport.tls.connect_failed", "tls connect");
const HANDSHAKE: OperationKind = OperationKind::new("sip.transport.tls.handshake_failed", "tls handshake");
const SEND: OperationKind = OperationKind::new("sip.transport.tls.send_failed", "tls send");

const READ_CHUNK_BYTES: usize = 2048;

fn apply_linger_zero(stream: &TcpStream) -> io::Result<()> {
    SockRef::from(stream).set_linger(Some(Duration::ZERO))
}

/// Stream-secure TLS channel. Construct via [`TlsChannel::bind`].
pub struct TlsChannel {
    channel_id: ChannelId,
    local_addr: EndPoint,
    listener_addr: EndPoint,
    pool: ConnectionPool<PooledConnection>,
    cancellation: Cancellation,
    closed_notify: Arc<Notify>,
    config: ChannelConfig,
    acceptor: Option<TlsAcceptor>,
    connector: TlsConnector,
    sink: Arc<dyn MessageSink>,
    framer: Arc<dyn MessageFramer>,
    self_ref: Weak<TlsChannel>,
}

impl TlsChannel {
    /// `server_config` is required when `listen` is true; `client_config`
    /// is required for every outbound dial. Both carry the certificate
    /// material and the [`server_cert_verifier`] policy chosen by the
    /// caller.
    pub async fn bind(
        bind_addr: SocketAddr,
        listen: bool,
        server_config: Option<Arc<rustls::ServerConfig>>,
        client_config: Arc<rustls::ClientConfig>,
        sink: Arc<dyn MessageSink>,
        framer: Arc<dyn MessageFramer>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, SendError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local = listener.local_addr().map_err(|err| map_io_error(BIND, err))?;
        let channel_id = ChannelIdGenerator::global().next_id();
        let local_ep =
            EndPoint::from_socket_addr(Protocol::Tls, local).with_channel_id(channel_id.to_string());

        let acceptor = server_config.map(TlsAcceptor::from);

        let channel = Arc::new_cyclic(|self_ref| Self {
            channel_id,
            local_addr: local_ep.clone(),
            listener_addr: local_ep,
            pool: ConnectionPool::new(config.max_stream_connections),
            cancellation: Cancellation::new(),
            closed_notify: Arc::new(Notify::new()),
            config,
            acceptor,
            connector: TlsConnector::from(client_config),
            sink,
            framer,
            self_ref: self_ref.clone(),
        });

        if listen {
            if channel.acceptor.is_none() {
                return Err(SendError::fault(
                    BIND,
                    io::Error::new(io::ErrorKind::InvalidInput, "listen requested without a server_config"),
                ));
            }
            channel.clone().spawn_accept_loop(listener);
        } else {
            drop(listener);
        }
        channel.clone().spawn_prune_loop();
        Ok(channel)
    }

    fn spawn_accept_loop(self: Arc<Self>, listener: TcpListener) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed_notify.notified() => break,
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => self.clone().spawn_accept_handshake(stream, peer),
                            Err(err) => warn!(error = %err, "tls accept failed"),
                        }
                    }
                }
            }
        });
    }

    fn spawn_accept_handshake(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tokio::spawn(async move {
            if let Err(err) = apply_linger_zero(&stream) {
                warn!(error = %err, "failed to apply linger-0 to accepted stream");
            }
            let acceptor = self.acceptor.clone().expect("listen requires an acceptor");
            let handshake = tokio::time::timeout(self.config.tls_handshake_timeout, acceptor.accept(stream)).await;
            let tls_stream = match handshake {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(error = %err, peer = %peer, "tls server handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "tls server handshake timed out");
                    return;
                }
            };

            let remote = EndPoint::from_socket_addr(Protocol::Tls, peer);
            let connection_id = ConnectionId::random();
            let (read_half, write_half) = tokio::io::split(tls_stream);
            let conn = Arc::new(PooledConnection::new(
                connection_id.clone(),
                StreamDirection::Accepted,
                remote,
                Box::new(write_half),
            ));
            if !self.pool.insert(connection_id, conn.clone()) {
                warn!("connection id collision on tls accept, dropping new connection");
                return;
            }
            self.spawn_read_loop(conn, Box::new(read_half));
        });
    }

    fn spawn_read_loop(self: &Arc<Self>, conn: Arc<PooledConnection>, mut read_half: connection::BoxedRead) {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(connection_id = %conn.connection_id, "peer closed tls connection");
                        break;
                    }
                    Ok(n) => {
                        conn.append(&buf[..n]);
                        match conn.extract_messages(channel.framer.as_ref()) {
                            Ok(messages) => {
                                if !messages.is_empty() {
                                    conn.touch();
                                }
                                for message in messages {
                                    let local = channel.local_addr.clone();
                                    let remote = conn
                                        .remote
                                        .clone()
                                        .with_connection_id(conn.connection_id.to_string());
                                    channel
                                        .sink
                                        .on_message(&channel.channel_id.to_string(), local, remote, Bytes::from(message))
                                        .await;
                                }
                            }
                            Err(()) => {
                                warn!(connection_id = %conn.connection_id, "invalid sip framing, closing tls connection");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(connection_id = %conn.connection_id, error = %err, "tls read failed");
                        break;
                    }
                }
            }
            channel.pool.remove(&conn.connection_id);
            if conn.begin_shutdown() {
                conn.shutdown().await;
            }
        });
    }

    fn spawn_prune_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.prune_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed_notify.notified() => break,
                    _ = ticker.tick() => {
                        let threshold = self.config.prune_idle_threshold;
                        let stale = self.pool.drain_matching(|conn| conn.idle_for() >= threshold);
                        for conn in stale {
                            if conn.begin_shutdown() {
                                conn.shutdown().await;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn dial(
        self: &Arc<Self>,
        dst_ep: &EndPoint,
        expected_server_name: &str,
    ) -> Result<Arc<PooledConnection>, SendError> {
        if !self.config.disable_local_loopback_check && dst_ep.is_socket_equal(&self.listener_addr) {
            return Err(SendError::fault(
                CONNECT,
                io::Error::new(io::ErrorKind::Other, "refusing to dial own listening endpoint"),
            ));
        }

        let connect_future = TcpStream::connect(dst_ep.socket_addr());
        let stream = tokio::time::timeout(self.config.tcp_connect_timeout, connect_future)
            .await
            .map_err(|_| SendError::timed_out(CONNECT, self.config.tcp_connect_timeout))?
            .map_err(|err| map_io_error(CONNECT, err))?;
        apply_linger_zero(&stream).map_err(|err| map_io_error(CONNECT, err))?;

        let server_name = ServerName::try_from(expected_server_name.to_string())
            .map_err(|_| SendError::ProtocolNotSupported)?;

        let handshake = tokio::time::timeout(
            self.config.tls_handshake_timeout,
            self.connector.connect(server_name, stream),
        )
        .await
        .map_err(|_| SendError::timed_out(HANDSHAKE, self.config.tls_handshake_timeout))?;

        let tls_stream = match handshake {
            Ok(stream) => stream,
            Err(_err) => {
                // A verifier rejection (CN mismatch, expired chain, unknown
                // issuer) and any other handshake failure both surface here
                // as "the peer could not be authenticated" (spec §4.5, §8 scenario 4).
                return Err(SendError::ProtocolNotSupported);
            }
        };

        let connection_id = ConnectionId::random();
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let conn = Arc::new(PooledConnection::new(
            connection_id.clone(),
            StreamDirection::Initiated,
            dst_ep.clone(),
            Box::new(write_half),
        ));
        if !self.pool.insert(connection_id, conn.clone()) {
            return Err(SendError::fault(
                CONNECT,
                io::Error::new(io::ErrorKind::Other, "connection id collision on connect"),
            ));
        }
        self.spawn_read_loop(conn.clone(), Box::new(read_half));
        Ok(conn)
    }
}

#[async_trait]
impl Channel for TlsChannel {
    async fn send_async(
        &self,
        _dst_ep: &EndPoint,
        _bytes: Bytes,
        _may_connect: bool,
        _connection_hint: Option<&str>,
    ) -> SipResult<()> {
        Err(SendError::NotImplemented)
    }

    async fn send_secure_async(
        &self,
        dst_ep: &EndPoint,
        bytes: Bytes,
        expected_server_name: &str,
        may_connect: bool,
        connection_hint: Option<&str>,
    ) -> SipResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(SendError::Disconnecting);
        }

        let conn = if let Some(hint) = connection_hint {
            self.pool.get(&ConnectionId::from_string(hint))
        } else {
            None
        };
        let conn = match conn {
            Some(conn) => conn,
            None => match self.pool.find(|c| c.remote.is_socket_equal(dst_ep)) {
                Some(conn) => conn,
                None => {
                    if !may_connect {
                        return Err(SendError::NotConnected);
                    }
                    let channel = self.self_ref.upgrade().ok_or(SendError::Disconnecting)?;
                    channel.dial(dst_ep, expected_server_name).await?
                }
            },
        };

        conn.write_all(&bytes).await.map_err(|err| map_io_error(SEND, err))
    }

    fn has_connection_by_id(&self, connection_id: &str) -> bool {
        self.pool.get(&ConnectionId::from_string(connection_id)).is_some()
    }

    fn has_connection_by_endpoint(&self, endpoint: &EndPoint) -> bool {
        self.pool.any(|c| c.remote.is_socket_equal(endpoint))
    }

    fn supports_address_family(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.local_addr.address.is_ipv4(),
            AddressFamily::V6 => self.local_addr.address.is_ipv6(),
        }
    }

    fn supports_protocol(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Tls)
    }

    fn listening_endpoint(&self) -> EndPoint {
        self.listener_addr.clone()
    }

    fn contact_uri_for(&self, destination: &EndPoint) -> String {
        let host = if self.local_addr.address.is_unspecified() {
            destination.address.to_string()
        } else {
            self.local_addr.address.to_string()
        };
        format!("sips:{}:{};transport=tls", host, self.local_addr.port)
    }

    async fn close(&self) {
        if !self.cancellation.cancel() {
            return;
        }
        self.closed_notify.notify_waiters();
        for conn in self.pool.values() {
            if conn.begin_shutdown() {
                conn.shutdown().await;
            }
        }
    }
}
