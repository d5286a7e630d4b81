//! Heartbeat: periodic ping, pong tracking, health flag (spec §4.5).
//!
//! `tokio-tungstenite` delivers pong frames as ordinary stream items rather
//! than via an out-of-band callback, so unlike the spec's callback framing,
//! pong observation here is a method the read pump calls
//! ([`Heartbeat::on_pong_received`]) when it sees `Message::Pong` — the
//! effect (refresh `last_pong`, mark healthy) is identical.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::WsSink;
use std::sync::Arc;

/// Shared health state for one socket incarnation.
pub struct Heartbeat {
    last_pong: Mutex<Instant>,
    healthy: AtomicBool,
    ping_period: Duration,
    pong_wait: Duration,
}

impl Heartbeat {
    pub fn new(ping_period: Duration, pong_wait: Duration) -> Self {
        Self {
            last_pong: Mutex::new(Instant::now()),
            healthy: AtomicBool::new(true),
            ping_period,
            pong_wait,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn on_pong_received(&self) {
        *self.last_pong.lock().expect("heartbeat mutex poisoned") = Instant::now();
        self.healthy.store(true, Ordering::Release);
    }

    fn reset(&self) {
        *self.last_pong.lock().expect("heartbeat mutex poisoned") = Instant::now();
        self.healthy.store(true, Ordering::Release);
    }

    /// Spawn the ping ticker and health monitor, bound to `socket_token`.
    /// Both share `write_mutex` with the write pump so control frames never
    /// interleave with payload frames (§4.2's single-write-mutex contract).
    pub fn spawn(
        self: &Arc<Self>,
        write_mutex: Arc<tokio::sync::Mutex<Option<WsSink>>>,
        write_timeout: Duration,
        socket_token: CancellationToken,
        reconnect_tx: mpsc::Sender<()>,
    ) {
        self.reset();
        let ping_this = self.clone();
        let ping_write = write_mutex.clone();
        let ping_token = socket_token.clone();
        let ping_reconnect = reconnect_tx.clone();
        tokio::spawn(async move {
            ping_this
                .ping_loop(ping_write, write_timeout, ping_token, ping_reconnect)
                .await;
        });

        let health_this = self.clone();
        let health_token = socket_token;
        tokio::spawn(async move {
            health_this.health_loop(health_token, reconnect_tx).await;
        });
    }

    async fn ping_loop(
        &self,
        write_mutex: Arc<tokio::sync::Mutex<Option<WsSink>>>,
        write_timeout: Duration,
        socket_token: CancellationToken,
        reconnect_tx: mpsc::Sender<()>,
    ) {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let mut ticker = tokio::time::interval(self.ping_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = socket_token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut guard = write_mutex.lock().await;
            let Some(sink) = guard.as_mut() else { return };
            let result =
                tokio::time::timeout(write_timeout, sink.send(Message::Ping(Vec::new()))).await;
            drop(guard);

            match result {
                Ok(Ok(())) => debug!("heartbeat: ping sent"),
                Ok(Err(e)) => {
                    warn!(error = %e, "heartbeat: ping write failed — signalling reconnect");
                    let _ = reconnect_tx.try_send(());
                    return;
                }
                Err(_) => {
                    warn!("heartbeat: ping write timed out — signalling reconnect");
                    let _ = reconnect_tx.try_send(());
                    return;
                }
            }
        }
    }

    async fn health_loop(&self, socket_token: CancellationToken, reconnect_tx: mpsc::Sender<()>) {
        let mut ticker = tokio::time::interval(self.ping_period);
        loop {
            tokio::select! {
                _ = socket_token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let elapsed = {
                let last_pong = self.last_pong.lock().expect("heartbeat mutex poisoned");
                last_pong.elapsed()
            };
            if elapsed > self.pong_wait {
                if self.healthy.swap(false, Ordering::AcqRel) {
                    warn!(?elapsed, "heartbeat: pong overdue — marking unhealthy");
                }
                let _ = reconnect_tx.try_send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_healthy() {
        let hb = Heartbeat::new(Duration::from_millis(10), Duration::from_millis(50));
        assert!(hb.is_healthy());
    }

    #[test]
    fn on_pong_received_refreshes_health() {
        let hb = Heartbeat::new(Duration::from_millis(10), Duration::from_millis(50));
        hb.healthy.store(false, Ordering::Release);
        hb.on_pong_received();
        assert!(hb.is_healthy());
    }

    #[tokio::test]
    async fn health_loop_marks_unhealthy_after_missed_pongs() {
        let hb = Arc::new(Heartbeat::new(
            Duration::from_millis(5),
            Duration::from_millis(15),
        ));
        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let hb2 = hb.clone();
        let token2 = token.clone();
        let handle = tokio::spawn(async move { hb2.health_loop(token2, tx).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        let _ = handle.await;

        assert!(!hb.is_healthy());
        assert!(rx.try_recv().is_ok());
    }
}
