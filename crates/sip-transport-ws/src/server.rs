//! WebSocket server channel (spec component C6, §4.6).
//!
//! One WebSocket message is one SIP message on this path — there is no
//! stream framer here, unlike C4/C5/C7. Each accepted client gets a fresh
//! `connection_id` and is dropped from the pool the moment its socket
//! closes or errors.

use crate::duplex::BoxedDuplex;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use sip_core::{
    AddressFamily, Cancellation, Channel, ChannelConfig, ChannelId, ChannelIdGenerator,
    ConnectionId, ConnectionPool, EndPoint, MessageSink, OperationKind, Protocol,
    Result as SipResult, SendError, StreamConnection, StreamDirection, map_io_error,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;
use tracing::{debug, warn};

const BIND: OperationKind = OperationKind::new("sip.transport.ws.server.bind_failed", "ws server bind");
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PooledConnection {
    pub connection_id: ConnectionId,
    pub remote: EndPoint,
    sink: AsyncMutex<SplitSink<WebSocketStream<BoxedDuplex>, Message>>,
    state: StdMutex<StreamConnection>,
    shutting_down: AtomicBool,
}

impl PooledConnection {
    fn new(
        connection_id: ConnectionId,
        remote: EndPoint,
        sink: SplitSink<WebSocketStream<BoxedDuplex>, Message>,
    ) -> Self {
        Self {
            connection_id: connection_id.clone(),
            remote: remote.clone(),
            sink: AsyncMutex::new(sink),
            state: StdMutex::new(StreamConnection::new(connection_id, StreamDirection::Accepted, remote)),
            shutting_down: AtomicBool::new(false),
        }
    }

    async fn send_message(&self, bytes: &[u8]) -> Result<(), tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(bytes.to_vec().into())).await?;
        self.touch();
        Ok(())
    }

    fn touch(&self) {
        self.state.lock().unwrap().touch();
    }

    fn idle_for(&self) -> Duration {
        self.state.lock().unwrap().idle_for()
    }

    fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        // Some OSes block on WebSocket/TCP teardown; the spec bounds this
        // at 5 s rather than letting `close()` hang indefinitely.
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
    }
}

/// WebSocket server channel. Construct via [`WsServerChannel::bind`]. The
/// TLS variant is selected by passing `Some(server_config)`.
pub struct WsServerChannel {
    channel_id: ChannelId,
    local_addr: EndPoint,
    pool: ConnectionPool<PooledConnection>,
    cancellation: Cancellation,
    closed_notify: Arc<Notify>,
    config: ChannelConfig,
    acceptor: Option<TlsAcceptor>,
    sink: Arc<dyn MessageSink>,
}

impl WsServerChannel {
    pub async fn bind(
        bind_addr: SocketAddr,
        server_config: Option<Arc<rustls::ServerConfig>>,
        sink: Arc<dyn MessageSink>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, SendError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local = listener.local_addr().map_err(|err| map_io_error(BIND, err))?;
        let channel_id = ChannelIdGenerator::global().next_id();
        let protocol = if server_config.is_some() { Protocol::Wss } else { Protocol::Ws };
        let local_ep = EndPoint::from_socket_addr(protocol, local).with_channel_id(channel_id.to_string());

        let channel = Arc::new(Self {
            channel_id,
            local_addr: local_ep,
            pool: ConnectionPool::new(config.max_stream_connections),
            cancellation: Cancellation::new(),
            closed_notify: Arc::new(Notify::new()),
            config,
            acceptor: server_config.map(TlsAcceptor::from),
            sink,
        });

        channel.clone().spawn_accept_loop(listener);
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
                            Ok((stream, peer)) => self.clone().spawn_upgrade(stream, peer),
                            Err(err) => warn!(error = %err, "ws server accept failed"),
                        }
                    }
                }
            }
        });
    }

    fn spawn_upgrade(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        tokio::spawn(async move {
            let boxed: BoxedDuplex = match &self.acceptor {
                Some(acceptor) => {
                    let handshake = tokio::time::timeout(self.config.tls_handshake_timeout, acceptor.accept(stream)).await;
                    match handshake {
                        Ok(Ok(tls_stream)) => Box::new(tls_stream),
                        Ok(Err(err)) => {
                            debug!(error = %err, peer = %peer, "ws server tls handshake failed");
                            return;
                        }
                        Err(_) => {
                            debug!(peer = %peer, "ws server tls handshake timed out");
                            return;
                        }
                    }
                }
                None => Box::new(stream),
            };

            let upgrade = tokio::time::timeout(UPGRADE_TIMEOUT, tokio_tungstenite::accept_async(boxed)).await;
            let ws_stream = match upgrade {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    debug!(error = %err, peer = %peer, "ws upgrade failed");
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "ws upgrade timed out");
                    return;
                }
            };

            let protocol = self.local_addr.protocol;
            let remote = EndPoint::from_socket_addr(protocol, peer);
            let connection_id = ConnectionId::random();
            let (sink, stream) = ws_stream.split();
            let conn = Arc::new(PooledConnection::new(connection_id.clone(), remote, sink));
            if !self.pool.insert(connection_id, conn.clone()) {
                warn!("connection id collision on ws accept, dropping new connection");
                return;
            }
            self.clone().spawn_read_loop(conn, stream);
        });
    }

    fn spawn_read_loop(
        self: Arc<Self>,
        conn: Arc<PooledConnection>,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<BoxedDuplex>>,
    ) {
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Binary(bytes))) => {
                        conn.touch();
                        let local = self.local_addr.clone();
                        let remote = conn.remote.clone().with_connection_id(conn.connection_id.to_string());
                        self.sink
                            .on_message(&self.channel_id.to_string(), local, remote, Bytes::from(bytes.to_vec()))
                            .await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        conn.touch();
                        let local = self.local_addr.clone();
                        let remote = conn.remote.clone().with_connection_id(conn.connection_id.to_string());
                        self.sink
                            .on_message(&self.channel_id.to_string(), local, remote, Bytes::from(text.as_bytes().to_vec()))
                            .await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection_id = %conn.connection_id, "ws client sent close frame");
                        break;
                    }
                    Some(Ok(_control_or_raw_frame)) => {
                        // Pings/pongs/raw frames carry no SIP payload; tungstenite
                        // answers pings with pongs on the write side automatically.
                    }
                    Some(Err(err)) => {
                        debug!(connection_id = %conn.connection_id, error = %err, "ws read failed");
                        break;
                    }
                    None => {
                        debug!(connection_id = %conn.connection_id, "ws stream ended");
                        break;
                    }
                }
            }
            self.pool.remove(&conn.connection_id);
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
}

#[async_trait]
impl Channel for WsServerChannel {
    async fn send_async(
        &self,
        dst_ep: &EndPoint,
        bytes: Bytes,
        _may_connect: bool,
        connection_hint: Option<&str>,
    ) -> SipResult<()> {
        if self.cancellation.is_cancelled() {
            return Err(SendError::Disconnecting);
        }
        let conn = match connection_hint {
            Some(hint) => self.pool.get(&ConnectionId::from_string(hint)),
            None => self.pool.find(|c| c.remote.is_socket_equal(dst_ep)),
        };
        // The server channel never dials out: a client always reaches it
        // first via the HTTP upgrade, so an absent connection is always
        // `NotConnected` regardless of `may_connect`.
        let conn = conn.ok_or(SendError::NotConnected)?;
        conn.send_message(&bytes)
            .await
            .map_err(|err| map_io_error(OperationKind::new("sip.transport.ws.server.send_failed", "ws server send"), io::Error::new(io::ErrorKind::Other, err.to_string())))
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
        matches!(protocol, Protocol::Ws | Protocol::Wss)
    }

    fn listening_endpoint(&self) -> EndPoint {
        self.local_addr.clone()
    }

    fn contact_uri_for(&self, destination: &EndPoint) -> String {
        let host = if self.local_addr.address.is_unspecified() {
            destination.address.to_string()
        } else {
            self.local_addr.address.to_string()
        };
        let scheme = if self.acceptor.is_some() { "wss" } else { "ws" };
        format!("sip:{}:{};transport={}", host, self.local_addr.port, scheme)
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
