//! WebSocket client channel (spec component C7, §4.7).
//!
//! Outbound-only and shared across every `ws://`/`wss://` peer the host
//! talks to. Unlike the stream channels, which spawn one read task per
//! connection, every egress connection's receive future is polled by a
//! single **receive monitor** task — new connections are handed to it over
//! an mpsc channel rather than each getting their own task.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use sip_core::{
    AddressFamily, Cancellation, Channel, ChannelConfig, ChannelId, ChannelIdGenerator,
    ConnectionId, ConnectionPool, EndPoint, MessageFramer, MessageSink, OperationKind, Protocol,
    Result as SipResult, SendError, StreamConnection, StreamDirection, map_io_error,
};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const CONNECT: OperationKind = OperationKind::new("sip.transport.ws.client.connect_failed", "ws client connect");
const SEND: OperationKind = OperationKind::new("sip.transport.ws.client.send_failed", "ws client send");

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct PooledConnection {
    pub connection_id: ConnectionId,
    pub remote: EndPoint,
    pub uri: String,
    sink: AsyncMutex<SplitSink<ClientStream, Message>>,
    state: StdMutex<StreamConnection>,
    shutting_down: AtomicBool,
}

impl PooledConnection {
    fn new(connection_id: ConnectionId, remote: EndPoint, uri: String, sink: SplitSink<ClientStream, Message>) -> Self {
        Self {
            connection_id: connection_id.clone(),
            remote: remote.clone(),
            uri,
            sink: AsyncMutex::new(sink),
            state: StdMutex::new(StreamConnection::new(connection_id, StreamDirection::Initiated, remote)),
            shutting_down: AtomicBool::new(false),
        }
    }

    async fn send_message(&self, bytes: &[u8]) -> Result<(), tungstenite::Error> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Binary(bytes.to_vec().into())).await?;
        self.touch();
        Ok(())
    }

    fn append(&self, bytes: &[u8]) {
        self.state.lock().unwrap().append(bytes);
    }

    fn extract_messages(&self, framer: &dyn MessageFramer) -> Result<Vec<Vec<u8>>, ()> {
        self.state.lock().unwrap().extract_messages(framer)
    }

    fn touch(&self) {
        self.state.lock().unwrap().touch();
    }

    fn idle_for(&self) -> std::time::Duration {
        self.state.lock().unwrap().idle_for()
    }

    fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    async fn shutdown(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// One egress connection's read half, handed from `dial` to the receive
/// monitor over an mpsc channel and rearmed by the monitor after each
/// message.
struct EgressSlot {
    connection_id: ConnectionId,
    stream: SplitStream<ClientStream>,
}

pub struct WsClientChannel {
    channel_id: ChannelId,
    local_addr: EndPoint,
    pool: ConnectionPool<PooledConnection>,
    cancellation: Cancellation,
    closed_notify: Arc<Notify>,
    config: ChannelConfig,
    client_tls_config: Option<Arc<rustls::ClientConfig>>,
    sink: Arc<dyn MessageSink>,
    framer: Arc<dyn MessageFramer>,
    new_conn_tx: mpsc::UnboundedSender<EgressSlot>,
}

impl WsClientChannel {
    /// `local_addr` is never bound to a socket — this channel is
    /// outbound-only — it only identifies the channel for
    /// `listening_endpoint`/`contact_uri_for` purposes.
    pub fn new(
        local_addr: SocketAddr,
        client_tls_config: Option<Arc<rustls::ClientConfig>>,
        sink: Arc<dyn MessageSink>,
        framer: Arc<dyn MessageFramer>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let channel_id = ChannelIdGenerator::global().next_id();
        let protocol = if client_tls_config.is_some() { Protocol::Wss } else { Protocol::Ws };
        let local_ep = EndPoint::from_socket_addr(protocol, local_addr).with_channel_id(channel_id.to_string());
        let (new_conn_tx, new_conn_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(Self {
            channel_id,
            local_addr: local_ep,
            pool: ConnectionPool::new(config.max_stream_connections),
            cancellation: Cancellation::new(),
            closed_notify: Arc::new(Notify::new()),
            config,
            client_tls_config,
            sink,
            framer,
            new_conn_tx,
        });

        channel.clone().spawn_receive_monitor(new_conn_rx);
        channel.clone().spawn_prune_loop();
        channel
    }

    fn uri_for(&self, dst_ep: &EndPoint) -> String {
        let scheme = if dst_ep.protocol == Protocol::Wss { "wss" } else { "ws" };
        format!("{scheme}://{}:{}", dst_ep.address, dst_ep.port)
    }

    async fn dial(&self, uri: &str, dst_ep: &EndPoint) -> Result<Arc<PooledConnection>, SendError> {
        let url = url::Url::parse(uri).map_err(|_| SendError::ProtocolNotSupported)?;
        let connector = self.client_tls_config.clone().map(Connector::Rustls);

        let connect_future = tokio_tungstenite::connect_async_tls_with_config(url.as_str(), None, false, connector);
        let (ws_stream, _response) = tokio::time::timeout(self.config.tcp_connect_timeout, connect_future)
            .await
            .map_err(|_| SendError::timed_out(CONNECT, self.config.tcp_connect_timeout))?
            .map_err(|err| SendError::fault(CONNECT, io::Error::new(io::ErrorKind::Other, err.to_string())))?;

        let connection_id = ConnectionId::from_uri_hash(uri);
        let (sink, stream) = ws_stream.split();
        let conn = Arc::new(PooledConnection::new(connection_id.clone(), dst_ep.clone(), uri.to_string(), sink));

        if !self.pool.insert(connection_id.clone(), conn.clone()) {
            // Another dial for the same uri won the race; this socket is
            // surplus, close it and hand back the winner instead.
            conn.shutdown().await;
            return self
                .pool
                .get(&connection_id)
                .ok_or_else(|| SendError::fault(CONNECT, io::Error::new(io::ErrorKind::Other, "lost connect race but winner vanished")));
        }

        let _ = self.new_conn_tx.send(EgressSlot { connection_id, stream });
        Ok(conn)
    }

    fn spawn_receive_monitor(self: Arc<Self>, mut new_conn_rx: mpsc::UnboundedReceiver<EgressSlot>) {
        tokio::spawn(async move {
            let mut pending = FuturesUnordered::new();
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed_notify.notified() => break,
                    maybe_slot = new_conn_rx.recv() => {
                        match maybe_slot {
                            Some(slot) => pending.push(Self::receive_one(slot)),
                            None => break,
                        }
                    }
                    maybe_item = pending.next(), if !pending.is_empty() => {
                        if let Some((slot, outcome)) = maybe_item {
                            if self.handle_egress_outcome(&slot, outcome).await {
                                pending.push(Self::receive_one(slot));
                            }
                        }
                    }
                }
            }
        });
    }

    async fn receive_one(mut slot: EgressSlot) -> (EgressSlot, Option<Result<Message, tungstenite::Error>>) {
        let item = slot.stream.next().await;
        (slot, item)
    }

    /// Returns `true` if the monitor should keep polling this connection.
    async fn handle_egress_outcome(
        self: &Arc<Self>,
        slot: &EgressSlot,
        outcome: Option<Result<Message, tungstenite::Error>>,
    ) -> bool {
        let conn = match self.pool.get(&slot.connection_id) {
            Some(conn) => conn,
            None => return false,
        };
        match outcome {
            Some(Ok(Message::Binary(bytes))) => self.deliver(&conn, &bytes).await,
            Some(Ok(Message::Text(text))) => self.deliver(&conn, text.as_bytes()).await,
            Some(Ok(Message::Close(_))) => {
                debug!(connection_id = %conn.connection_id, "ws egress connection closed by peer");
                self.pool.remove(&slot.connection_id);
                false
            }
            Some(Ok(_control_or_raw_frame)) => true,
            Some(Err(err)) => {
                debug!(connection_id = %conn.connection_id, error = %err, "ws egress read failed");
                self.pool.remove(&slot.connection_id);
                false
            }
            None => {
                debug!(connection_id = %conn.connection_id, "ws egress stream ended");
                self.pool.remove(&slot.connection_id);
                false
            }
        }
    }

    /// Routes bytes through the same stream-framer C4/C5 use, since
    /// WebSocket binary-frame boundaries are not trusted to align with SIP
    /// message boundaries on this path (spec §4.7).
    async fn deliver(&self, conn: &Arc<PooledConnection>, bytes: &[u8]) -> bool {
        conn.append(bytes);
        match conn.extract_messages(self.framer.as_ref()) {
            Ok(messages) => {
                if !messages.is_empty() {
                    conn.touch();
                }
                for message in messages {
                    let local = self.local_addr.clone();
                    let remote = conn.remote.clone().with_connection_id(conn.connection_id.to_string());
                    self.sink
                        .on_message(&self.channel_id.to_string(), local, remote, Bytes::from(message))
                        .await;
                }
                true
            }
            Err(()) => {
                warn!(connection_id = %conn.connection_id, "invalid sip framing, closing ws egress connection");
                self.pool.remove(&conn.connection_id);
                false
            }
        }
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
impl Channel for WsClientChannel {
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

        let uri = self.uri_for(dst_ep);
        let key = connection_hint
            .map(ConnectionId::from_string)
            .unwrap_or_else(|| ConnectionId::from_uri_hash(&uri));

        let conn = match self.pool.get(&key) {
            Some(conn) => conn,
            None => {
                if !may_connect {
                    return Err(SendError::NotConnected);
                }
                self.dial(&uri, dst_ep).await?
            }
        };

        conn.send_message(&bytes)
            .await
            .map_err(|err| map_io_error(SEND, io::Error::new(io::ErrorKind::Other, err.to_string())))
    }

    fn has_connection_by_id(&self, connection_id: &str) -> bool {
        self.pool.get(&ConnectionId::from_string(connection_id)).is_some()
    }

    fn has_connection_by_endpoint(&self, endpoint: &EndPoint) -> bool {
        self.pool.any(|c| c.remote.is_socket_equal(endpoint))
    }

    fn has_connection_by_uri(&self, uri: &str) -> bool {
        self.pool.get(&ConnectionId::from_uri_hash(uri)).is_some()
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
        let scheme = if self.client_tls_config.is_some() { "wss" } else { "ws" };
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
