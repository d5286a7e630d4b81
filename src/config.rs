//! Connection configuration (spec §6 parameter table).
//!
//! A plain, validated-at-construction record — no file/CLI/env layering.
//! That layering belongs to the out-of-scope pool/transport façade that
//! would sit above many [`crate::connection::Connection`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::limiter::RateLimiter;

/// TLS material carrier. Interface-only: this crate does not implement a
/// TLS stack, it accepts one from the caller (e.g. a `rustls::ClientConfig`
/// wrapped here) and passes it through to `tokio-tungstenite`'s connector.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub min_version: TlsVersion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum TlsVersion {
    #[default]
    Tls12,
    Tls13,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub max_reconnect_attempts: u32,
    pub initial_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub reconnect_backoff_multiplier: f64,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub max_message_size: usize,
    pub write_buffer_size: usize,
    pub read_buffer_size: usize,
    pub enable_compression: bool,
    pub headers: HashMap<String, String>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub tls: Option<TlsConfig>,
}

impl ConnectionConfig {
    /// Construct with every field defaulted except `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_reconnect_attempts: 0,
            initial_reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            reconnect_backoff_multiplier: 2.0,
            dial_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            ping_period: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            max_message_size: 16 * 1024 * 1024,
            write_buffer_size: 1000,
            read_buffer_size: 1000,
            enable_compression: false,
            headers: HashMap::new(),
            rate_limiter: None,
            tls: None,
        }
    }

    /// Fail fast on construction, not on first use (per the teacher's
    /// `DaemonConfig` validation posture — see `DESIGN.md`).
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.url.is_empty() {
            return Err(TransportError::ConfigInvalid("url is empty".to_string()));
        }
        let scheme_ok = self.url.starts_with("ws://") || self.url.starts_with("wss://");
        if !scheme_ok {
            return Err(TransportError::ConfigInvalid(format!(
                "url must use ws:// or wss:// scheme: {}",
                self.url
            )));
        }
        if self.pong_wait <= self.ping_period {
            return Err(TransportError::ConfigInvalid(
                "pong_wait must exceed ping_period".to_string(),
            ));
        }
        if self.reconnect_backoff_multiplier < 1.0 {
            return Err(TransportError::ConfigInvalid(
                "reconnect_backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_url() {
        let cfg = ConnectionConfig::new("");
        assert!(matches!(
            cfg.validate(),
            Err(TransportError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn rejects_bad_scheme() {
        let cfg = ConnectionConfig::new("http://example.com");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn accepts_ws_and_wss() {
        assert!(ConnectionConfig::new("ws://example.com").validate().is_ok());
        assert!(ConnectionConfig::new("wss://example.com").validate().is_ok());
    }

    #[test]
    fn rejects_pong_wait_not_exceeding_ping_period() {
        let mut cfg = ConnectionConfig::new("wss://example.com");
        cfg.ping_period = Duration::from_secs(30);
        cfg.pong_wait = Duration::from_secs(30);
        assert!(cfg.validate().is_err());
    }
}
