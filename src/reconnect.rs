//! The reconnection engine (spec §4.4): a signal-driven task that retires
//! the dead socket, sleeps an exponential backoff, and redials.
//!
//! Grounded on `retry.rs`'s `retry_with_backoff` — the delay computation
//! (`delay * multiplier`, capped at `max_delay`) is lifted from that file's
//! loop, adapted from a generic retry-a-closure helper into a task that
//! cooperates with the Connection state machine via signals instead of
//! looping inline around a single call. See `DESIGN.md`.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::connection::Connection;

/// `backoff(n) = min(initial * multiplier^n, max)` (spec §4.4, §8 property).
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    let scaled = initial.as_secs_f64() * multiplier.powi(attempt as i32);
    Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
}

/// Spawn the auto-reconnect task. `reconnect_rx` is taken once from the
/// Connection by `start_auto_reconnect` so this can only run one instance
/// per Connection.
pub(crate) fn spawn(connection: Connection, mut reconnect_rx: mpsc::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = connection.life_cancelled() => return,
                signal = reconnect_rx.recv() => {
                    if signal.is_none() {
                        return; // sender dropped — Connection is closing
                    }
                }
            }

            let max_attempts = connection.max_reconnect_attempts();
            let attempts_before = connection.reconnect_attempts();
            if max_attempts != 0 && attempts_before >= max_attempts {
                warn!(attempts = attempts_before, "reconnect: max attempts exhausted");
                connection.settle_disconnected_after_exhaustion();
                continue;
            }

            connection.disconnect_for_reconnect().await;

            let (initial, max, multiplier) = connection.reconnect_backoff_params();
            let delay = backoff_delay(attempts_before, initial, max, multiplier);
            tokio::select! {
                biased;
                _ = connection.life_cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = connection.bump_reconnect_attempts();
            info!(attempt, delay_ms = delay.as_millis(), "reconnect: attempting");
            match connection.connect().await {
                Ok(()) => info!("reconnect: succeeded"),
                Err(e) => {
                    warn!(error = %e, "reconnect: attempt failed");
                    connection.retry_reconnect_signal();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_matches_literal_scenario() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(30);
        let expected_ms = [100u64, 200, 400, 800, 1600];
        for (n, expected) in expected_ms.iter().enumerate() {
            let d = backoff_delay(n as u32, initial, max, 2.0);
            let got = d.as_millis() as u64;
            let tolerance = expected / 10; // ±10%
            assert!(
                got.abs_diff(*expected) <= tolerance.max(1),
                "attempt {n}: expected ~{expected}ms, got {got}ms"
            );
        }
    }

    #[test]
    fn backoff_caps_at_max() {
        let d = backoff_delay(20, Duration::from_millis(100), Duration::from_secs(30), 2.0);
        assert_eq!(d, Duration::from_secs(30));
    }
}
