//! Certificate-validation hook (spec §4.5).
//!
//! Certificate provisioning (where root stores and server key material come
//! from) stays an external concern — callers hand in an already-built
//! `rustls::ServerConfig`/`RootCertStore`, mirroring the teacher's
//! `HotReloadingServerConfig` taking a pre-built `Arc<ServerConfig>` rather
//! than raw PEM. What this module owns is the one switch the spec asks
//! implementers to make explicit: whether a policy-failed certificate is
//! ever accepted.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::{DigitallySignedStruct, RootCertStore};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use std::fmt;
use std::sync::Arc;

/// Accepts any certificate chain without validation. Development only —
/// never constructed unless `bypass_certificate_validation` is set.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl fmt::Display for AcceptAnyServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcceptAnyServerCert (development-only bypass)")
    }
}

/// Builds the verifier a client-side `rustls::ClientConfig` should use.
/// `bypass` MUST only ever be wired to `ChannelConfig::bypass_certificate_validation`.
pub fn server_cert_verifier(
    roots: Arc<RootCertStore>,
    bypass: bool,
) -> Result<Arc<dyn ServerCertVerifier>, rustls::Error> {
    if bypass {
        tracing::warn!("TLS certificate validation is bypassed; do not run this configuration in production");
        return Ok(Arc::new(AcceptAnyServerCert));
    }
    WebPkiServerVerifier::builder(roots)
        .build()
        .map(|verifier| verifier as Arc<dyn ServerCertVerifier>)
        .map_err(|err| rustls::Error::General(err.to_string()))
}
