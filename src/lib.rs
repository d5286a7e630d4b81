pub mod config;
pub mod connection;
pub mod error;
pub mod facade;
pub mod heartbeat;
pub mod limiter;
pub mod metrics;
pub mod reconnect;
pub mod security;

pub use config::{ConnectionConfig, TlsConfig, TlsVersion};
pub use connection::{ConnState, Connection};
pub use error::TransportError;
pub use limiter::RateLimiter;
pub use metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
