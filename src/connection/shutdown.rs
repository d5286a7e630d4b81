//! Shutdown protocol (spec §4.3) — aggressive, bounded teardown tolerant of
//! double-close. Rust's ownership model makes "recover from close-of-closed-
//! channel panic" moot (dropping a sender or cancelling a token twice is
//! infallible), so the idempotent-close idiom here is a `closed_once`
//! compare-exchange guard that picks one caller to run the teardown, plus a
//! `close_completed` flag every other caller (concurrent or arriving after
//! the first close finished) polls to observe completion — see `DESIGN.md`.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::SinkExt;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;

use super::state::ConnState;
use super::Inner;

/// Total budget for waiting on pump tasks to exit during `Close()`.
const SHUTDOWN_BUDGET: Duration = Duration::from_millis(400);

/// Force-close the current socket: drop both halves after a best-effort
/// close-frame write. Tolerates any error — the socket may already be dead.
pub(super) async fn force_close_socket(inner: &Inner) {
    {
        let mut guard = inner.write_half.lock().await;
        if let Some(sink) = guard.as_mut() {
            let _ = tokio::time::timeout(
                Duration::from_millis(50),
                sink.send(Message::Close(None)),
            )
            .await;
        }
        *guard = None;
    }
    *inner.read_half.lock().await = None;
}

pub(super) async fn close_sequence(inner: &std::sync::Arc<Inner>) {
    if inner.closed_once.swap(true, Ordering::AcqRel) {
        // Someone else is already closing, or already finished — either way
        // wait for completion rather than running the teardown twice.
        wait_for_close_completion(inner).await;
        return;
    }

    // Phase 1: publish intent.
    inner.channels_closed.store(true, Ordering::Release);
    let _ = inner.state.try_set_from_any(
        &[
            ConnState::Disconnected,
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Reconnecting,
        ],
        ConnState::Closing,
    );

    // Phase 2: heartbeat is cooperative — it stops when its socket_token
    // (a child of life_token) is cancelled in phase 3.
    if let Some(hb) = inner.heartbeat.lock().expect("heartbeat mutex poisoned").take() {
        drop(hb);
    }

    // Phase 3: cancel life_token (subsumes every socket_token derived from it).
    inner.life_token.cancel();

    // Phase 4: force-close the socket.
    force_close_socket(inner).await;

    // Phase 5: bounded wait for pump tasks.
    let handles: Vec<_> = std::mem::take(
        &mut *inner.pump_handles.lock().expect("pump handles mutex poisoned"),
    );
    let joined = tokio::time::timeout(SHUTDOWN_BUDGET, futures_util::future::join_all(handles)).await;
    if joined.is_err() {
        info!("close: shutdown budget exceeded, proceeding — socket is already dead");
    }

    // Phase 6: close the public channels. Dropping the stored sender halves
    // makes further `Send`/reconnect-trigger calls observe a closed channel;
    // this is infallible in Rust so there is nothing to double-close-guard.
    inner.outgoing_tx.lock().await.take();

    // Phase 7: terminal transition.
    let _ = inner.state.try_set(ConnState::Closing, ConnState::Closed);
    inner.close_completed.store(true, Ordering::Release);
    inner.close_notify.notify_waiters();
}

/// Wait for a close already in progress, or already finished, to complete.
///
/// `Notify::notify_waiters` wakes only waiters already registered at the
/// moment it fires — it stores no permit for a `notified()` call made
/// afterward. A caller arriving after the first `close()` has fully
/// completed would otherwise park forever. Polling `close_completed` on a
/// bounded interval instead of awaiting `notified()` unconditionally closes
/// that window: a late caller returns on the first check, and a concurrent
/// caller that misses a wakeup simply re-checks on the next tick.
async fn wait_for_close_completion(inner: &Inner) {
    loop {
        if inner.close_completed.load(Ordering::Acquire) {
            return;
        }
        let notified = inner.close_notify.notified();
        if inner.close_completed.load(Ordering::Acquire) {
            return;
        }
        let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
    }
}
