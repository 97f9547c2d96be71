use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{Channel, ChannelConfig, EndPoint, FrameOutcome, MessageFramer, MessageSink, SendError};
use sip_transport_ws::{WsClientChannel, WsServerChannel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The client path routes bytes through a stream-framer; a message here is
/// exactly `SIZE` bytes, large enough to hold the test payloads below.
struct FixedSizeFramer {
    size: usize,
}

impl MessageFramer for FixedSizeFramer {
    fn parse(&self, window: &[u8]) -> FrameOutcome {
        if window.len() < self.size {
            FrameOutcome::Incomplete
        } else {
            FrameOutcome::Complete {
                message: window[..self.size].to_vec(),
                consumed: self.size,
            }
        }
    }
}

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

async fn wait_for_count(sink: &CollectingSink, target: usize) {
    for _ in 0..150 {
        if sink.count.load(Ordering::SeqCst) >= target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {target} messages");
}

#[tokio::test(flavor = "multi_thread")]
async fn client_dial_delivers_one_message_per_ws_frame_on_the_server_side() {
    let sink_server = Arc::new(CollectingSink::new());
    let server = WsServerChannel::bind("127.0.0.1:0".parse().unwrap(), None, sink_server.clone(), ChannelConfig::default())
        .await
        .unwrap();

    let framer = Arc::new(FixedSizeFramer { size: 40 });
    let client = WsClientChannel::new(
        "127.0.0.1:0".parse().unwrap(),
        None,
        Arc::new(CollectingSink::new()),
        framer,
        ChannelConfig::default(),
    );

    let message = vec![b'Q'; 40];
    client
        .send_async(&server.listening_endpoint(), Bytes::from(message.clone()), true, None)
        .await
        .unwrap();

    wait_for_count(&sink_server, 1).await;
    let received = sink_server.received.lock().await;
    assert_eq!(received[0].2.as_ref(), &message[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_send_to_the_same_peer_reuses_the_pooled_egress_connection() {
    let sink_server = Arc::new(CollectingSink::new());
    let server = WsServerChannel::bind("127.0.0.1:0".parse().unwrap(), None, sink_server.clone(), ChannelConfig::default())
        .await
        .unwrap();

    let framer = Arc::new(FixedSizeFramer { size: 40 });
    let client = WsClientChannel::new(
        "127.0.0.1:0".parse().unwrap(),
        None,
        Arc::new(CollectingSink::new()),
        framer,
        ChannelConfig::default(),
    );

    let dst = server.listening_endpoint();
    client.send_async(&dst, Bytes::from(vec![b'A'; 40]), true, None).await.unwrap();
    wait_for_count(&sink_server, 1).await;

    assert!(client.has_connection_by_uri(&format!("ws://{}:{}", dst.address, dst.port)));

    // may_connect=false only succeeds here because the first send's egress
    // connection is still pooled and reused.
    client.send_async(&dst, Bytes::from(vec![b'B'; 40]), false, None).await.unwrap();
    wait_for_count(&sink_server, 2).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn send_without_existing_connection_and_may_connect_false_is_not_connected() {
    let framer = Arc::new(FixedSizeFramer { size: 40 });
    let client = WsClientChannel::new(
        "127.0.0.1:0".parse().unwrap(),
        None,
        Arc::new(CollectingSink::new()),
        framer,
        ChannelConfig::default(),
    );

    let unreachable = EndPoint::new(sip_core::Protocol::Ws, "127.0.0.1".parse().unwrap(), 1);
    let result = client.send_async(&unreachable, Bytes::from_static(b"x"), false, None).await;
    assert!(matches!(result, Err(SendError::NotConnected)));
}

#[tokio::test(flavor = "multi_thread")]
async fn server_send_without_a_pooled_client_is_not_connected() {
    let sink_server = Arc::new(CollectingSink::new());
    let server = WsServerChannel::bind("127.0.0.1:0".parse().unwrap(), None, sink_server, ChannelConfig::default())
        .await
        .unwrap();

    let unreachable = EndPoint::new(sip_core::Protocol::Ws, "127.0.0.1".parse().unwrap(), 1);
    let result = server.send_async(&unreachable, Bytes::from_static(b"x"), false, None).await;
    assert!(matches!(result, Err(SendError::NotConnected)));
}
