//! Server-side upgrade admission gate (spec §4.7): the ordered checks a
//! WebSocket handshake request must pass before it is accepted.
//!
//! Grounded structurally on `ipc/mod.rs`'s `handle_connection` (sequential
//! gate checks before a connection is accepted) and `ipc/auth.rs`'s bearer
//! parsing; the per-IP limiter map follows the teacher's plain
//! `Mutex<HashMap<...>>` precedent rather than adding a concurrent-map
//! dependency (§9 Decision, `DESIGN.md`).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::jwt::{AuthContext, JwtValidator};
use crate::error::TransportError;
use crate::limiter::RateLimiter;

/// Minimal shape of an incoming upgrade request the admission layer needs.
/// Deliberately framework-agnostic: callers populate this from whatever HTTP
/// library fronts the upgrade (axum, hyper, etc. are all out of scope here).
#[derive(Clone, Debug, Default)]
pub struct UpgradeRequest {
    pub remote_addr: Option<IpAddr>,
    pub x_forwarded_for: Option<String>,
    pub x_real_ip: Option<String>,
    pub origin: Option<String>,
    pub is_tls: bool,
    pub tls_version: Option<crate::config::TlsVersion>,
    pub authorization: Option<String>,
    pub query_token: Option<String>,
    pub sec_websocket_protocol: Vec<String>,
}

impl UpgradeRequest {
    /// X-Forwarded-For → X-Real-IP → RemoteAddr (spec §4.7 step 2).
    fn resolve_client_ip(&self) -> Option<IpAddr> {
        if let Some(xff) = &self.x_forwarded_for {
            if let Some(first) = xff.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return Some(ip);
                }
            }
        }
        if let Some(xri) = &self.x_real_ip {
            if let Ok(ip) = xri.trim().parse() {
                return Some(ip);
            }
        }
        self.remote_addr
    }

    fn bearer_token(&self) -> Option<String> {
        if let Some(header) = &self.authorization {
            if let Some(token) = header.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
        if let Some(token) = &self.query_token {
            return Some(token.clone());
        }
        self.sec_websocket_protocol
            .iter()
            .find_map(|p| p.strip_prefix("auth.").map(str::to_string))
    }
}

pub struct OriginPolicy {
    pub whitelist: Vec<String>,
    pub strict: bool,
}

impl OriginPolicy {
    fn check(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return !self.strict;
        };
        let host = origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://"))
            .unwrap_or(origin);
        self.whitelist.iter().any(|allowed| {
            if allowed == "*" {
                true
            } else if let Some(suffix) = allowed.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == allowed
            }
        })
    }
}

pub struct TlsPolicy {
    pub required: bool,
    pub min_version: crate::config::TlsVersion,
}

pub struct AdmissionConfig {
    pub max_connections: u64,
    pub origin: OriginPolicy,
    pub tls: TlsPolicy,
    pub require_auth: bool,
    pub jwt: Option<JwtValidator>,
    pub global_rate: Arc<RateLimiter>,
    pub per_client_rate: fn() -> RateLimiter,
    pub cleanup_interval: Duration,
}

struct TrackedLimiter {
    limiter: RateLimiter,
}

/// Bookkeeping record for one connection that passed `validate_upgrade` and
/// was handed to `secure_connection` — tracked so the periodic sweep can
/// evict stale entries (§4.7: "secure-connection records older than 30
/// minutes").
struct SecureConnectionRecord {
    established_at: Instant,
    client_ip: Option<IpAddr>,
}

/// Maximum age of a tracked secure-connection record before the cleanup
/// sweep removes it (§4.7).
const SECURE_RECORD_TTL: Duration = Duration::from_secs(30 * 60);

/// Returned by [`AdmissionManager::secure_connection`]: the caller's raw
/// connection handle paired with the auth context established during
/// `validate_upgrade`, plus the tracking id used to release it later.
pub struct SecuredConnection<T> {
    pub raw: T,
    pub auth: AuthContext,
    id: u64,
}

#[derive(Default)]
pub struct AdmissionStats {
    pub accepted: u64,
    pub rejected: u64,
    pub active_connections: u64,
    pub tracked_clients: u64,
    pub tracked_secure_connections: u64,
}

/// Shared gate in front of every inbound upgrade. Cheaply cloneable.
pub struct AdmissionManager {
    config: AdmissionConfig,
    per_client: Mutex<HashMap<IpAddr, Arc<TrackedLimiter>>>,
    secure_connections: Mutex<HashMap<u64, SecureConnectionRecord>>,
    next_secure_id: AtomicU64,
    active_connections: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AdmissionManager {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            per_client: Mutex::new(HashMap::new()),
            secure_connections: Mutex::new(HashMap::new()),
            next_secure_id: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn reject(&self, reason: &'static str) -> TransportError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(reason, "admission: upgrade rejected");
        match reason {
            "rate_limited" => TransportError::RateLimited,
            "connection_limit" => TransportError::ConnectionLimitExceeded,
            "origin" => TransportError::OriginRejected,
            "tls_required" => TransportError::TLSRequired,
            "tls_version" => TransportError::TLSVersionLow,
            "auth_missing" => TransportError::AuthMissing,
            _ => TransportError::AuthFailed(reason.to_string()),
        }
    }

    /// Run the six ordered checks from spec §4.7. Returns an `AuthContext`
    /// on success (empty/default if auth is not required).
    pub fn validate_upgrade(&self, req: &UpgradeRequest) -> Result<AuthContext, TransportError> {
        if !self.config.global_rate.allow() {
            return Err(self.reject("rate_limited"));
        }

        if let Some(ip) = req.resolve_client_ip() {
            let limiter = self.get_or_create_limiter(ip);
            if !limiter.limiter.allow() {
                return Err(self.reject("rate_limited"));
            }
        }

        if self.active_connections.load(Ordering::Acquire) >= self.config.max_connections {
            return Err(self.reject("connection_limit"));
        }

        if !self.config.origin.check(req.origin.as_deref()) {
            return Err(self.reject("origin"));
        }

        if self.config.tls.required && !req.is_tls {
            return Err(self.reject("tls_required"));
        }
        if req.is_tls {
            if let Some(version) = req.tls_version {
                if version < self.config.tls.min_version {
                    return Err(self.reject("tls_version"));
                }
            }
        }

        let ctx = if self.config.require_auth {
            let token = req.bearer_token().ok_or_else(|| self.reject("auth_missing"))?;
            let validator = self
                .config
                .jwt
                .as_ref()
                .ok_or_else(|| self.reject("auth_not_configured"))?;
            match validator.validate_token(&token) {
                Ok(ctx) => ctx,
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "admission: token validation failed");
                    return Err(e);
                }
            }
        } else {
            AuthContext::default()
        };

        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::AcqRel);
        Ok(ctx)
    }

    /// Signal that a previously-accepted connection has ended.
    pub fn release_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Attach `auth` (from a successful `validate_upgrade`) to the caller's
    /// raw upgraded connection and register it for the 30-minute staleness
    /// sweep (§4.7, §6 `SecureConnection(raw, authCtx, req)`).
    pub fn secure_connection<T>(&self, raw: T, auth: AuthContext, req: &UpgradeRequest) -> SecuredConnection<T> {
        let id = self.next_secure_id.fetch_add(1, Ordering::Relaxed);
        self.secure_connections.lock().expect("admission map poisoned").insert(
            id,
            SecureConnectionRecord {
                established_at: Instant::now(),
                client_ip: req.resolve_client_ip(),
            },
        );
        SecuredConnection { raw, auth, id }
    }

    /// Stop tracking a secure connection that closed normally, ahead of the
    /// 30-minute sweep.
    pub fn release_secure_connection<T>(&self, secured: &SecuredConnection<T>) {
        self.secure_connections
            .lock()
            .expect("admission map poisoned")
            .remove(&secured.id);
    }

    /// Tear down the admission manager: drop every tracked per-client
    /// limiter and secure-connection record (§6 `Shutdown()`). Does not
    /// touch `active_connections`/stats counters, which reflect history.
    pub fn shutdown(&self) {
        self.per_client.lock().expect("admission map poisoned").clear();
        self.secure_connections
            .lock()
            .expect("admission map poisoned")
            .clear();
    }

    fn get_or_create_limiter(&self, ip: IpAddr) -> Arc<TrackedLimiter> {
        let mut map = self.per_client.lock().expect("admission map poisoned");
        map.entry(ip)
            .or_insert_with(|| {
                Arc::new(TrackedLimiter {
                    limiter: (self.config.per_client_rate)(),
                })
            })
            .clone()
    }

    /// Periodic sweep (§4.7, §9 Decision 2): evict limiters whose bucket has
    /// refilled to burst capacity (idle proxy) AND that have existed for at
    /// least one cleanup interval, so a client is never evicted on its first
    /// idle tick. Also evicts secure-connection records older than 30
    /// minutes (§4.7).
    pub fn cleanup_sweep(&self) {
        let mut map = self.per_client.lock().expect("admission map poisoned");
        map.retain(|_, tracked| {
            let idle = tracked.limiter.is_at_burst_capacity();
            let old_enough = tracked.limiter.age() >= self.config.cleanup_interval;
            !(idle && old_enough)
        });
        drop(map);

        let mut secure = self.secure_connections.lock().expect("admission map poisoned");
        secure.retain(|_, record| record.established_at.elapsed() < SECURE_RECORD_TTL);
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            tracked_clients: self.per_client.lock().expect("admission map poisoned").len() as u64,
            tracked_secure_connections: self
                .secure_connections
                .lock()
                .expect("admission map poisoned")
                .len() as u64,
        }
    }

    /// Spawn the periodic cleanup task. Runs until `token` cancels.
    pub fn spawn_cleanup(self: &Arc<Self>, token: tokio_util::sync::CancellationToken) {
        let this = self.clone();
        let interval = this.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => this.cleanup_sweep(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_connections: u64) -> AdmissionManager {
        AdmissionManager::new(AdmissionConfig {
            max_connections,
            origin: OriginPolicy {
                whitelist: vec!["example.com".to_string(), "*.trusted.io".to_string()],
                strict: true,
            },
            tls: TlsPolicy {
                required: false,
                min_version: crate::config::TlsVersion::Tls12,
            },
            require_auth: false,
            jwt: None,
            global_rate: Arc::new(RateLimiter::unlimited()),
            per_client_rate: RateLimiter::test_preset,
            cleanup_interval: Duration::from_secs(60),
        })
    }

    fn req(origin: &str) -> UpgradeRequest {
        UpgradeRequest {
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            origin: Some(origin.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_whitelisted_origin() {
        let m = manager(10);
        assert!(m.validate_upgrade(&req("https://example.com")).is_ok());
    }

    #[test]
    fn accepts_wildcard_suffix_origin() {
        let m = manager(10);
        assert!(m.validate_upgrade(&req("https://app.trusted.io")).is_ok());
    }

    #[test]
    fn rejects_unlisted_origin() {
        let m = manager(10);
        assert!(matches!(
            m.validate_upgrade(&req("https://evil.example")),
            Err(TransportError::OriginRejected)
        ));
    }

    #[test]
    fn rejects_missing_origin_when_strict() {
        let m = manager(10);
        let r = UpgradeRequest {
            remote_addr: Some("127.0.0.1".parse().unwrap()),
            origin: None,
            ..Default::default()
        };
        assert!(matches!(
            m.validate_upgrade(&r),
            Err(TransportError::OriginRejected)
        ));
    }

    #[test]
    fn enforces_connection_limit() {
        let m = manager(1);
        assert!(m.validate_upgrade(&req("https://example.com")).is_ok());
        assert!(matches!(
            m.validate_upgrade(&req("https://example.com")),
            Err(TransportError::ConnectionLimitExceeded)
        ));
    }

    #[test]
    fn release_connection_frees_a_slot() {
        let m = manager(1);
        assert!(m.validate_upgrade(&req("https://example.com")).is_ok());
        m.release_connection();
        assert!(m.validate_upgrade(&req("https://example.com")).is_ok());
    }

    #[test]
    fn requires_auth_when_configured() {
        let mut m = manager(10);
        m.config.require_auth = true;
        assert!(matches!(
            m.validate_upgrade(&req("https://example.com")),
            Err(TransportError::AuthMissing)
        ));
    }

    #[test]
    fn cleanup_sweep_evicts_idle_clients_past_min_age() {
        let m = manager(10);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        m.get_or_create_limiter(ip);
        // Freshly created: full burst but too young to evict.
        m.cleanup_sweep();
        assert_eq!(m.stats().tracked_clients, 1);
    }

    #[test]
    fn secure_connection_registers_a_tracked_record() {
        let m = manager(10);
        let auth = AuthContext::default();
        let secured = m.secure_connection(42_u32, auth, &req("https://example.com"));
        assert_eq!(secured.raw, 42);
        assert_eq!(m.stats().tracked_secure_connections, 1);
    }

    #[test]
    fn release_secure_connection_untracks_it() {
        let m = manager(10);
        let secured = m.secure_connection("conn", AuthContext::default(), &req("https://example.com"));
        assert_eq!(m.stats().tracked_secure_connections, 1);
        m.release_secure_connection(&secured);
        assert_eq!(m.stats().tracked_secure_connections, 0);
    }

    #[test]
    fn cleanup_sweep_leaves_fresh_secure_connections() {
        let m = manager(10);
        let _secured = m.secure_connection("conn", AuthContext::default(), &req("https://example.com"));
        m.cleanup_sweep();
        assert_eq!(m.stats().tracked_secure_connections, 1);
    }

    #[test]
    fn shutdown_clears_clients_and_secure_connections() {
        let m = manager(10);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        m.get_or_create_limiter(ip);
        let _secured = m.secure_connection("conn", AuthContext::default(), &req("https://example.com"));
        m.shutdown();
        let stats = m.stats();
        assert_eq!(stats.tracked_clients, 0);
        assert_eq!(stats.tracked_secure_connections, 0);
    }
}
