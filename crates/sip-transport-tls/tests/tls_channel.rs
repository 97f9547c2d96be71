use async_trait::async_trait;
use bytes::Bytes;
use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use sip_core::{Channel, ChannelConfig, EndPoint, FrameOutcome, MessageFramer, MessageSink, SendError};
use sip_transport_tls::{server_cert_verifier, TlsChannel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::Mutex;

static CRYPTO_PROVIDER: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A self-signed certificate plus a root store that trusts it.
struct TestCert {
    server_config: Arc<rustls::ServerConfig>,
    roots: Arc<rustls::RootCertStore>,
}

fn issue_cert(subject_alt_name: &str) -> TestCert {
    let certified = rcgen::generate_simple_self_signed(vec![subject_alt_name.to_string()])
        .expect("self-signed cert generation should succeed");
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())
        .expect("server config should accept the freshly issued cert/key pair");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).expect("root store should accept the self-signed cert");

    TestCert {
        server_config: Arc::new(server_config),
        roots: Arc::new(roots),
    }
}

fn client_config(roots: Arc<rustls::RootCertStore>) -> Arc<rustls::ClientConfig> {
    let verifier = server_cert_verifier(roots, false).expect("verifier should build from a non-empty root store");
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
    )
}

/// A message is exactly `SIZE` bytes — enough to exercise the stream framer
/// boundary without pulling in SIP message semantics.
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
    for _ in 0..100 {
        if sink.count.load(Ordering::SeqCst) >= target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {target} messages");
}

#[tokio::test(flavor = "multi_thread")]
async fn matching_server_name_completes_handshake_and_delivers_message() {
    ensure_crypto_provider();

    let cert = issue_cert("localhost");
    let sink_server = Arc::new(CollectingSink::new());
    let framer = Arc::new(FixedSizeFramer { size: 64 });

    let server = TlsChannel::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        Some(cert.server_config.clone()),
        client_config(cert.roots.clone()),
        sink_server.clone(),
        framer.clone(),
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    let client = TlsChannel::bind(
        "127.0.0.1:0".parse().unwrap(),
        false,
        None,
        client_config(cert.roots.clone()),
        Arc::new(CollectingSink::new()),
        framer.clone(),
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    let message = vec![b'M'; 64];
    client
        .send_secure_async(
            &server.listening_endpoint(),
            Bytes::from(message.clone()),
            "localhost",
            true,
            None,
        )
        .await
        .unwrap();

    wait_for_count(&sink_server, 1).await;
    let received = sink_server.received.lock().await;
    assert_eq!(received[0].2.as_ref(), &message[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn server_name_mismatch_is_rejected_as_protocol_not_supported() {
    ensure_crypto_provider();

    let cert = issue_cert("localhost");
    let framer = Arc::new(FixedSizeFramer { size: 64 });

    let server = TlsChannel::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        Some(cert.server_config.clone()),
        client_config(cert.roots.clone()),
        Arc::new(CollectingSink::new()),
        framer.clone(),
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    let client = TlsChannel::bind(
        "127.0.0.1:0".parse().unwrap(),
        false,
        None,
        client_config(cert.roots.clone()),
        Arc::new(CollectingSink::new()),
        framer,
        ChannelConfig::default(),
    )
    .await
    .unwrap();

    // The cert's only SAN is "localhost"; a client that insists on a
    // different expected name must fail verification rather than connect.
    let result = client
        .send_secure_async(
            &server.listening_endpoint(),
            Bytes::from(vec![b'M'; 64]),
            "impostor.example",
            true,
            None,
        )
        .await;

    assert!(matches!(result, Err(SendError::ProtocolNotSupported)));
}

#[tokio::test(flavor = "multi_thread")]
async fn listen_without_server_config_is_a_bind_fault() {
    ensure_crypto_provider();

    let cert = issue_cert("localhost");
    let framer = Arc::new(FixedSizeFramer { size: 64 });

    let result = TlsChannel::bind(
        "127.0.0.1:0".parse().unwrap(),
        true,
        None,
        client_config(cert.roots),
        Arc::new(CollectingSink::new()),
        framer,
        ChannelConfig::default(),
    )
    .await;

    assert!(matches!(result, Err(SendError::Fault { .. })));
}
