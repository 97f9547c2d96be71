//! Configuration knobs enumerated in spec §6.

use std::time::Duration;

/// Tunables shared by every channel variant. Each stream-oriented channel
/// embeds one; the UDP channel only consults `udp_failed_dst_ttl_s`.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Permit sending to the channel's own listening socket. Off by default
    /// so accidental loops are rejected during normal operation; flip on in
    /// tests that deliberately talk to themselves.
    pub disable_local_loopback_check: bool,
    /// Accept TLS peers that fail OS certificate validation. Development
    /// only — the default hook never sets this for production wiring.
    pub bypass_certificate_validation: bool,
    pub prune_interval: Duration,
    pub prune_idle_threshold: Duration,
    pub tcp_connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub max_stream_connections: usize,
    pub udp_failed_dst_ttl: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            disable_local_loopback_check: false,
            bypass_certificate_validation: false,
            prune_interval: Duration::from_secs(60),
            prune_idle_threshold: Duration::from_secs(70 * 60),
            tcp_connect_timeout: Duration::from_millis(5000),
            tls_handshake_timeout: Duration::from_millis(5000),
            max_stream_connections: 1000,
            udp_failed_dst_ttl: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.prune_interval, Duration::from_secs(60));
        assert_eq!(cfg.prune_idle_threshold, Duration::from_secs(4200));
        assert_eq!(cfg.tcp_connect_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.tls_handshake_timeout, Duration::from_millis(5000));
        assert_eq!(cfg.max_stream_connections, 1000);
        assert_eq!(cfg.udp_failed_dst_ttl, Duration::from_secs(30));
        assert!(!cfg.disable_local_loopback_check);
        assert!(!cfg.bypass_certificate_validation);
    }
}
