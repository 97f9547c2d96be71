//! Stream-plain TCP channel (spec component C4, §4.4).
//!
//! Listener and outbound dialer share one [`sip_core::ConnectionPool`]
//! keyed by `connection_id`, with a linear-scan secondary lookup by remote
//! end-point for the send-dispatch sequence spec §4.4 lays out. Every
//! accepted or dialed socket gets `Linger(on=true, timeout=0)` so closing it
//! (explicitly or via the idle pruner) sends a TCP RST.

mod connection;
mod socket_config;

pub use connection::PooledConnection;
pub use socket_config::TcpSocketConfig;

use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{
    AddressFamily, Cancellation, Channel, ChannelConfig, ChannelId, ChannelIdGenerator,
    ConnectionId, ConnectionPool, EndPoint, MessageFramer, MessageSink, OperationKind, Protocol,
    Result as SipResult, SendError, StreamDirection, map_io_error,
};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, warn};

const BIND: OperationKind = OperationKind::new("sip.transport.tcp.bind_failed", "tcp bind");
const CONNECT: OperationKind = OperationKind::new("sip.transport.tcp.connect_failed", "tcp connect");
const SEND: OperationKind = OperationKind::new("sip.transport.tcp.send_failed", "tcp send");

const READ_CHUNK_BYTES: usize = 2048;

/// Stream-plain TCP channel. Construct via [`TcpChannel::bind`].
pub struct TcpChannel {
    channel_id: ChannelId,
    local_addr: EndPoint,
    listener_addr: EndPoint,
    pool: ConnectionPool<PooledConnection>,
    cancellation: Cancellation,
    closed_notify: Arc<Notify>,
    config: ChannelConfig,
    socket_config: TcpSocketConfig,
    sink: Arc<dyn MessageSink>,
    framer: Arc<dyn MessageFramer>,
    /// Lets a `&self` trait method (`send_async`) recover an `Arc<Self>` to
    /// hand to `dial`, which spawns a read-loop task that must outlive the
    /// call.
    self_ref: Weak<TcpChannel>,
}

impl TcpChannel {
    /// Binds (and, if `listen` is true, starts accepting on) `bind_addr`.
    pub async fn bind(
        bind_addr: SocketAddr,
        listen: bool,
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
            EndPoint::from_socket_addr(Protocol::Tcp, local).with_channel_id(channel_id.to_string());

        let channel = Arc::new_cyclic(|self_ref| Self {
            channel_id,
            local_addr: local_ep.clone(),
            listener_addr: local_ep,
            pool: ConnectionPool::new(config.max_stream_connections),
            cancellation: Cancellation::new(),
            closed_notify: Arc::new(Notify::new()),
            config,
            socket_config: TcpSocketConfig::new(),
            sink,
            framer,
            self_ref: self_ref.clone(),
        });

        if listen {
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
                            Ok((stream, peer)) => self.accept_stream(stream, peer),
                            Err(err) => {
                                warn!(error = %err, "tcp accept failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn accept_stream(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(err) = self.socket_config.apply(&stream) {
            warn!(error = %err, "failed to apply socket config to accepted stream");
        }
        let remote = EndPoint::from_socket_addr(Protocol::Tcp, peer);
        let connection_id = ConnectionId::random();
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(PooledConnection::new(
            connection_id.clone(),
            StreamDirection::Accepted,
            remote,
            write_half,
        ));
        if !self.pool.insert(connection_id, conn.clone()) {
            warn!("connection id collision on accept, dropping new connection");
            return;
        }
        self.clone().spawn_read_loop(conn, read_half);
    }

    fn spawn_read_loop(
        self: Arc<Self>,
        conn: Arc<PooledConnection>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(connection_id = %conn.connection_id, "peer closed tcp connection");
                        break;
                    }
                    Ok(n) => {
                        conn.append(&buf[..n]);
                        match conn.extract_messages(self.framer.as_ref()) {
                            Ok(messages) => {
                                if !messages.is_empty() {
                                    conn.touch();
                                }
                                // Delivered in-line, in order: spawning one
                                // task per message would not preserve the
                                // arrival order the host relies on.
                                for message in messages {
                                    let local = self.local_addr.clone();
                                    let remote = conn
                                        .remote
                                        .clone()
                                        .with_connection_id(conn.connection_id.to_string());
                                    self.sink
                                        .on_message(&self.channel_id.to_string(), local, remote, Bytes::from(message))
                                        .await;
                                }
                            }
                            Err(()) => {
                                warn!(connection_id = %conn.connection_id, "invalid sip framing, closing connection");
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        debug!(connection_id = %conn.connection_id, error = %err, "tcp read failed");
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
                            debug!(connection_id = %conn.connection_id, "pruning idle tcp connection");
                            if conn.begin_shutdown() {
                                conn.shutdown().await;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn dial(self: &Arc<Self>, dst_ep: &EndPoint) -> Result<Arc<PooledConnection>, SendError> {
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

        self.socket_config
            .apply(&stream)
            .map_err(|err| map_io_error(CONNECT, err))?;

        let connection_id = ConnectionId::random();
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(PooledConnection::new(
            connection_id.clone(),
            StreamDirection::Initiated,
            dst_ep.clone(),
            write_half,
        ));

        // Register before the first send completes: a response on this
        // connection must find the pending entry (spec §4.4).
        if !self.pool.insert(connection_id, conn.clone()) {
            return Err(SendError::fault(
                CONNECT,
                io::Error::new(io::ErrorKind::Other, "connection id collision on connect"),
            ));
        }
        self.clone().spawn_read_loop(conn.clone(), read_half);
        Ok(conn)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_async(
        &self,
        dst_ep: &EndPoint,
        bytes: Bytes,
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
                    channel.dial(dst_ep).await?
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
        matches!(protocol, Protocol::Tcp)
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
        format!("sip:{}:{};transport=tcp", host, self.local_addr.port)
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
