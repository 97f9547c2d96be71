//! UDP datagram channel (spec component C3, §4.3).
//!
//! One cooperative receive task loops: allocate a `MAX_SIP_MESSAGE_BYTES`
//! buffer, await `recv_from`, hand the datagram to the registered
//! [`MessageSink`], reissue. Datagram channels are connectionless —
//! `has_connection_by_*` always reports `false` — but they still track a
//! short-TTL failed-destination set so a recently ICMP-rejected peer fails
//! fast instead of going through another wasted `send_to`.

mod failed_destinations;

pub use failed_destinations::FailedDestinations;

use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{
    AddressFamily, Cancellation, Channel, ChannelConfig, ChannelId, ChannelIdGenerator, EndPoint,
    MessageSink, Protocol, SendError, map_io_error, OperationKind,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, warn};

const RECV_BUFFER_BYTES: usize = sip_core::MAX_SIP_MESSAGE_BYTES;
const SEND: OperationKind = OperationKind::new("sip.transport.udp.send_failed", "udp send");
const BIND: OperationKind = OperationKind::new("sip.transport.udp.bind_failed", "udp bind");
const EXPIRY_TICK: std::time::Duration = std::time::Duration::from_secs(5);

/// UDP datagram channel.
pub struct UdpChannel {
    channel_id: ChannelId,
    socket: Arc<UdpSocket>,
    local_addr: EndPoint,
    dual_stack: bool,
    failed: Arc<FailedDestinations>,
    cancellation: Cancellation,
    closed_notify: Arc<Notify>,
    config: ChannelConfig,
}

impl UdpChannel {
    /// Binds a UDP socket and starts the background receive and
    /// failed-destination-expiry tasks.
    pub async fn bind(
        bind_addr: SocketAddr,
        dual_stack: bool,
        sink: Arc<dyn MessageSink>,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, SendError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|err| map_io_error(BIND, err))?;
        let local = socket.local_addr().map_err(|err| map_io_error(BIND, err))?;
        let channel_id = ChannelIdGenerator::global().next_id();
        let local_ep = EndPoint::from_socket_addr(Protocol::Udp, local).with_channel_id(channel_id.to_string());

        let channel = Arc::new(Self {
            channel_id,
            socket: Arc::new(socket),
            local_addr: local_ep,
            dual_stack,
            failed: Arc::new(FailedDestinations::new(config.udp_failed_dst_ttl)),
            cancellation: Cancellation::new(),
            closed_notify: Arc::new(Notify::new()),
            config,
        });

        channel.clone().spawn_receive_loop(sink);
        channel.clone().spawn_expiry_loop();
        Ok(channel)
    }

    fn spawn_receive_loop(self: Arc<Self>, sink: Arc<dyn MessageSink>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUFFER_BYTES];
            loop {
                if self.cancellation.is_cancelled() {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = self.closed_notify.notified() => break,
                    result = self.socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, peer)) => {
                                let remote = EndPoint::from_socket_addr(Protocol::Udp, peer);
                                let bytes = Bytes::copy_from_slice(&buf[..len]);
                                let local = self.local_addr.clone();
                                let sink = sink.clone();
                                let channel_id = self.channel_id.to_string();
                                tokio::spawn(async move {
                                    sink.on_message(&channel_id, local, remote, bytes).await;
                                });
                            }
                            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                                // A prior send's ICMP port-unreachable surfaced here. We have
                                // no peer address attached to this error (plain recv_from
                                // doesn't carry one on an unconnected socket on most
                                // platforms); see spec's Open Questions on packet-info.
                                // Callers that need precise attribution should run with a
                                // platform-specific error-queue reader and call
                                // `report_icmp_failure` directly.
                                warn!("udp recv_from observed an ICMP rejection with no attributable peer");
                            }
                            Err(err) => {
                                debug!(error = %err, "udp recv_from failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_expiry_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_TICK);
            loop {
                tokio::select! {
                    biased;
                    _ = self.closed_notify.notified() => break,
                    _ = ticker.tick() => {
                        self.failed.expire();
                    }
                }
            }
        });
    }

    /// Records that `remote` rejected a datagram via ICMP, for the
    /// `udp_failed_dst_ttl` window. Exposed so a platform-specific
    /// error-queue reader can attribute failures precisely.
    pub fn report_icmp_failure(&self, remote: &EndPoint) {
        self.failed.insert(remote.clone());
    }

    fn map_to_dual_stack(&self, dst: SocketAddr) -> SocketAddr {
        if !self.dual_stack {
            return dst;
        }
        match dst {
            SocketAddr::V4(v4) if self.local_addr.address.is_ipv6() => {
                let mapped = Ipv6Addr::from(v4.ip().to_ipv6_mapped().octets());
                SocketAddr::new(IpAddr::V6(mapped), v4.port())
            }
            other => other,
        }
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send_async(
        &self,
        dst_ep: &EndPoint,
        bytes: Bytes,
        _may_connect: bool,
        _connection_hint: Option<&str>,
    ) -> sip_core::Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(SendError::Disconnecting);
        }
        if self.failed.is_active(dst_ep) {
            return Err(SendError::ConnectionRefused);
        }
        let dst = self.map_to_dual_stack(dst_ep.socket_addr());
        self.socket
            .send_to(&bytes, dst)
            .await
            .map_err(|err| map_io_error(SEND, err))?;
        Ok(())
    }

    fn has_connection_by_id(&self, _connection_id: &str) -> bool {
        false
    }

    fn has_connection_by_endpoint(&self, _endpoint: &EndPoint) -> bool {
        false
    }

    fn supports_address_family(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.local_addr.address.is_ipv4() || self.dual_stack,
            AddressFamily::V6 => self.local_addr.address.is_ipv6(),
        }
    }

    fn supports_protocol(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Udp)
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
        format!("sip:{}:{};transport=udp", host, self.local_addr.port)
    }

    async fn close(&self) {
        if self.cancellation.cancel() {
            self.closed_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct CollectingSink {
        received: Mutex<Vec<(EndPoint, EndPoint, Bytes)>>,
        count: AtomicUsize,
    }

    impl CollectingSink {
        fn new() -> Self {
            Self {
                received: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSink for CollectingSink {
        async fn on_message(&self, _channel_id: &str, local: EndPoint, remote: EndPoint, bytes: Bytes) {
            self.received.lock().await.push((local, remote, bytes));
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn bind_loopback(sink: Arc<dyn MessageSink>) -> Arc<UdpChannel> {
        UdpChannel::bind(
            "127.0.0.1:0".parse().unwrap(),
            false,
            sink,
            ChannelConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_and_receive_one_datagram() {
        let sink = Arc::new(CollectingSink::new());
        let receiver = bind_loopback(sink.clone()).await;
        let sender = bind_loopback(Arc::new(CollectingSink::new())).await;

        let payload = Bytes::from_static(b"0123456789012345678\n");
        assert_eq!(payload.len(), 20);
        sender
            .send_async(&receiver.listening_endpoint(), payload.clone(), true, None)
            .await
            .unwrap();

        for _ in 0..50 {
            if sink.count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let received = sink.received.lock().await;
        assert_eq!(received.len(), 1);
        let (_, remote, bytes) = &received[0];
        assert_eq!(*bytes, payload);
        assert_eq!(remote.port, sender.listening_endpoint().port);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_to_failed_destination_short_circuits() {
        let sink = Arc::new(CollectingSink::new());
        let channel = bind_loopback(sink).await;
        let dst = EndPoint::new(Protocol::Udp, "127.0.0.1".parse().unwrap(), 1);
        channel.report_icmp_failure(&dst);

        let result = channel.send_async(&dst, Bytes::from_static(b"x"), true, None).await;
        assert!(matches!(result, Err(SendError::ConnectionRefused)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_is_idempotent_and_rejects_further_sends_eventually() {
        let sink = Arc::new(CollectingSink::new());
        let channel = bind_loopback(sink).await;
        channel.close().await;
        channel.close().await;
        assert!(channel.cancellation.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn has_connection_is_always_false() {
        let sink = Arc::new(CollectingSink::new());
        let channel = bind_loopback(sink).await;
        assert!(!channel.has_connection_by_id("anything"));
        assert!(!channel.has_connection_by_endpoint(&channel.listening_endpoint()));
    }
}
