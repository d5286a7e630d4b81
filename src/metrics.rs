//! Per-connection counters, generalized from the teacher's daemon-wide
//! `DaemonMetrics` (see `DESIGN.md`). Lock-free; no metrics sink is bundled
//! (out of scope per §1) — callers read a point-in-time [`ConnectionMetricsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct ConnectionMetrics {
    pub connect_attempts: AtomicU64,
    pub connect_successes: AtomicU64,
    pub disconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_queued: AtomicU64,
    pub bytes_queued: AtomicU64,
    pub errors: AtomicU64,
    created_at: Instant,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connect_successes: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_queued: AtomicU64::new(0),
            bytes_queued: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn inc_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connect_success(&self) {
        self.connect_successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Called once by the write pump when a frame actually leaves the
    /// socket (§4.2 step 8). The only writer of `messages_sent`/`bytes_sent`.
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Called by `Connection::send` when a payload is accepted onto the
    /// outgoing queue, distinct from actual transmission.
    pub fn record_queued(&self, bytes: usize) {
        self.messages_queued.fetch_add(1, Ordering::Relaxed);
        self.bytes_queued.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        ConnectionMetricsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_successes: self.connect_successes.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Default for ConnectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time read of [`ConnectionMetrics`]; what `GetMetrics()` (§6)
/// returns and what a pool façade's `PoolStats::snapshot()` would aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMetricsSnapshot {
    pub connect_attempts: u64,
    pub connect_successes: u64,
    pub disconnects: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_queued: u64,
    pub bytes_queued: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = ConnectionMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 0);
        assert_eq!(snap.errors, 0);
    }

    #[test]
    fn record_sent_increments_both_counters() {
        let m = ConnectionMetrics::new();
        m.record_sent(42);
        m.record_sent(8);
        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 50);
    }

    #[test]
    fn queued_and_sent_counters_are_independent() {
        let m = ConnectionMetrics::new();
        m.record_queued(10);
        let snap = m.snapshot();
        assert_eq!(snap.messages_queued, 1);
        assert_eq!(snap.messages_sent, 0, "enqueue must not bump the sent counter");
        m.record_sent(10);
        let snap = m.snapshot();
        assert_eq!(snap.messages_sent, 1);
        assert_eq!(snap.messages_queued, 1);
    }
}
