//! Read and write pumps (spec §4.2): capture `(socket, generation)`, act,
//! revalidate. Any mismatch after the I/O step is a stale-generation exit,
//! not an error — a reconnect may have swapped the socket mid-flight.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::state::ConnState;
use super::{Connection, Inner};
use crate::error::TransportError;

/// Short I/O deadline used to probe for cancellation responsively (§4.2 step 3).
const IO_POLL: Duration = Duration::from_millis(75);

fn is_current(inner: &Inner, captured_generation: u64) -> bool {
    inner.generation.load(Ordering::Acquire) == captured_generation
}

pub(super) async fn read_pump(inner: Arc<Inner>, generation: u64, socket_token: CancellationToken) {
    let connection = Connection(inner.clone());
    loop {
        if socket_token.is_cancelled() || inner.state.is_at_least_closing() {
            break;
        }
        if !is_current(&inner, generation) {
            trace!(generation, "read pump: stale generation, exiting");
            break;
        }

        let mut guard = inner.read_half.lock().await;
        let Some(source) = guard.as_mut() else {
            break;
        };

        let step = tokio::select! {
            biased;
            _ = socket_token.cancelled() => { drop(guard); break; }
            r = tokio::time::timeout(IO_POLL, source.next()) => r,
        };
        drop(guard);

        let item = match step {
            Err(_) => continue, // deadline pulse — loop to re-probe cancellation
            Ok(None) => break,  // stream ended
            Ok(Some(item)) => item,
        };

        if !is_current(&inner, generation) {
            break; // reconnect swapped the socket while this read was in flight
        }

        match item {
            Ok(message) => handle_message(&connection, &inner, &socket_token, message).await,
            Err(e) => {
                let err: TransportError = e.into();
                if crate::error::is_benign_pump_exit(&err) {
                    debug!(error = %err, "read pump: benign exit");
                } else {
                    inner.metrics.inc_error();
                    if inner.state.is(ConnState::Connected) {
                        connection.fire_on_error(&err);
                        connection.trigger_reconnect();
                    }
                }
                break;
            }
        }
    }
}

async fn handle_message(
    connection: &Connection,
    inner: &Arc<Inner>,
    socket_token: &CancellationToken,
    message: Message,
) {
    // Classification is synchronous; guard it against an unexpected panic
    // bubbling out of a malformed frame the same way the teacher's framer
    // calls are defensively wrapped (DESIGN.md notes tokio-tungstenite
    // normally returns `Err` instead of panicking, so this is a backstop).
    let classified = catch_unwind(AssertUnwindSafe(|| classify(message)));
    let Ok(action) = classified else {
        warn!("read pump: panic while classifying frame — treating as stale");
        return;
    };

    match action {
        PumpAction::Data(bytes) => {
            inner.metrics.record_received(bytes.len());
            connection.fire_on_message(bytes);
        }
        PumpAction::Pong => {
            if let Some(hb) = inner.heartbeat.lock().expect("heartbeat mutex poisoned").clone() {
                hb.on_pong_received();
                if inner.state.is(ConnState::Reconnecting) && hb.is_healthy() {
                    inner.state.try_set(ConnState::Reconnecting, ConnState::Connected);
                }
            }
        }
        PumpAction::Ping => {
            let mut guard = inner.write_half.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = tokio::time::timeout(
                    inner.config.write_timeout,
                    sink.send(Message::Pong(Vec::new())),
                )
                .await;
            }
        }
        PumpAction::PeerClosed => {
            socket_token.cancel();
        }
        PumpAction::Ignored => {}
    }
}

enum PumpAction {
    Data(Vec<u8>),
    Pong,
    Ping,
    PeerClosed,
    Ignored,
}

fn classify(message: Message) -> PumpAction {
    match message {
        Message::Binary(b) => PumpAction::Data(b),
        Message::Text(t) => PumpAction::Data(t.into_bytes()),
        Message::Pong(_) => PumpAction::Pong,
        Message::Ping(_) => PumpAction::Ping,
        Message::Close(_) => PumpAction::PeerClosed,
        Message::Frame(_) => PumpAction::Ignored,
    }
}

pub(super) async fn write_pump(inner: Arc<Inner>, generation: u64, socket_token: CancellationToken) {
    let connection = Connection(inner.clone());
    let mut rx = inner.outgoing_rx.lock().await;

    loop {
        if !is_current(&inner, generation) {
            break;
        }

        let maybe_payload = tokio::select! {
            biased;
            _ = socket_token.cancelled() => None,
            _ = tokio::time::sleep(IO_POLL) => { continue }
            recvd = rx.recv() => recvd,
        };

        let Some(payload) = maybe_payload else {
            break;
        };

        if !is_current(&inner, generation) {
            break;
        }

        let mut guard = inner.write_half.lock().await;
        let Some(sink) = guard.as_mut() else {
            drop(guard);
            break;
        };
        let len = payload.len();
        let result =
            tokio::time::timeout(inner.config.write_timeout, sink.send(Message::Binary(payload))).await;
        drop(guard);

        match result {
            Ok(Ok(())) => inner.metrics.record_sent(len),
            Ok(Err(e)) => {
                let err: TransportError = e.into();
                inner.metrics.inc_error();
                if !crate::error::is_benign_pump_exit(&err) && inner.state.is(ConnState::Connected) {
                    connection.fire_on_error(&err);
                    connection.trigger_reconnect();
                }
                break;
            }
            Err(_) => {
                inner.metrics.inc_error();
                break;
            }
        }
    }

    // Drain so any producer parked in `Send` is released (§4.2).
    while rx.try_recv().is_ok() {}
}
