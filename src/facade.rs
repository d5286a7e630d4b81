//! Interface-only stubs for the out-of-scope higher-level façade: a pool
//! that fans an `Event` across many [`crate::connection::Connection`]s,
//! compression middleware, and pool-wide stats (SPEC_FULL.md §6a).
//!
//! None of these are implemented here — they define the seam a façade
//! crate would fill. Shape grounded on `ipc/event.rs`'s `EventBroadcaster`
//! (a thin dispatch wrapper, not a pool/routing implementation).

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::metrics::ConnectionMetricsSnapshot;

/// An opaque payload envelope a façade would route across connections.
/// Carries no validation logic of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub topic: String,
    pub bytes: Vec<u8>,
}

/// Implemented by a pool/transport façade that fans an [`Event`] across
/// many connections, e.g. with topic-based routing or load balancing.
pub trait EventSink: Send + Sync {
    fn send_event(&self, event: &Event) -> Result<(), TransportError>;
}

/// A pass-through compression hook for already-framed messages.
/// `Connection` only calls this if one is installed; absent a codec,
/// `enable_compression` means "negotiate `permessage-deflate` at the
/// WebSocket layer only," not application-level compression.
pub trait CompressionCodec: Send + Sync {
    fn encode(&self, frame: &[u8]) -> Vec<u8>;
    fn decode(&self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Implemented by a connection pool to expose aggregate visibility.
pub trait PoolStats: Send + Sync {
    fn active_connections(&self) -> usize;
    fn snapshot(&self) -> Vec<ConnectionMetricsSnapshot>;
}
