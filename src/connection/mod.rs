//! The Connection state machine — per-socket lifecycle, concurrent read/write
//! pumps, heartbeat, and the generation-counter scheme that defeats races
//! between reconnection and in-flight I/O (spec §3, §4.1, §4.2).
//!
//! Grounded on `relay/mod.rs`'s `relay_loop` (connect/select!/reconnect
//! shape) and `ipc/mod.rs`'s `handle_connection` (handshake-timeout dial,
//! `tokio::select!` shutdown racing) from the teacher daemon — see
//! `DESIGN.md`.

mod pumps;
mod shutdown;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConnectionConfig;
use crate::error::{is_benign_pump_exit, TransportError};
use crate::heartbeat::Heartbeat;
use crate::metrics::{ConnectionMetrics, ConnectionMetricsSnapshot};
use state::StateWord;
pub use state::ConnState;

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = futures_util::stream::SplitSink<WsStream, tokio_tungstenite::tungstenite::Message>;
pub type WsSource = futures_util::stream::SplitStream<WsStream>;

type OnConnect = Arc<dyn Fn() + Send + Sync>;
type OnDisconnect = Arc<dyn Fn(Option<String>) + Send + Sync>;
type OnMessage = Arc<dyn Fn(Vec<u8>) + Send + Sync>;
type OnError = Arc<dyn Fn(&TransportError) + Send + Sync>;

#[derive(Default)]
struct HandlerSlots {
    on_connect: RwLock<Option<OnConnect>>,
    on_disconnect: RwLock<Option<OnDisconnect>>,
    on_message: RwLock<Option<OnMessage>>,
    on_error: RwLock<Option<OnError>>,
}

pub(crate) struct Inner {
    pub(crate) config: ConnectionConfig,
    pub(crate) state: StateWord,
    pub(crate) generation: AtomicU64,
    pub(crate) write_half: Arc<AsyncMutex<Option<WsSink>>>,
    pub(crate) read_half: Arc<AsyncMutex<Option<WsSource>>>,
    pub(crate) outgoing_tx: AsyncMutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub(crate) outgoing_rx: Arc<AsyncMutex<mpsc::Receiver<Vec<u8>>>>,
    pub(crate) reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: AsyncMutex<Option<mpsc::Receiver<()>>>,
    pub(crate) channels_closed: AtomicBool,
    closed_once: AtomicBool,
    close_completed: AtomicBool,
    close_notify: Notify,
    pub(crate) life_token: CancellationToken,
    socket_token: std::sync::Mutex<CancellationToken>,
    pub(crate) reconnect_attempts: AtomicU32,
    pub(crate) metrics: Arc<ConnectionMetrics>,
    handlers: HandlerSlots,
    pub(crate) heartbeat: std::sync::Mutex<Option<Arc<Heartbeat>>>,
    last_error: std::sync::Mutex<Option<String>>,
    last_connected: std::sync::Mutex<Option<Instant>>,
    pump_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// A managed WebSocket client connection. Cheaply cloneable — all clones
/// share one `Inner` via `Arc`, mirroring the teacher's `CircuitBreaker`
/// clone-shares-state idiom.
#[derive(Clone)]
pub struct Connection(Arc<Inner>);

impl Connection {
    pub fn new(config: ConnectionConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.write_buffer_size.max(1));
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

        let inner = Inner {
            config,
            state: StateWord::new(ConnState::Disconnected),
            generation: AtomicU64::new(0),
            write_half: Arc::new(AsyncMutex::new(None)),
            read_half: Arc::new(AsyncMutex::new(None)),
            outgoing_tx: AsyncMutex::new(Some(outgoing_tx)),
            outgoing_rx: Arc::new(AsyncMutex::new(outgoing_rx)),
            reconnect_tx,
            reconnect_rx: AsyncMutex::new(Some(reconnect_rx)),
            channels_closed: AtomicBool::new(false),
            closed_once: AtomicBool::new(false),
            close_completed: AtomicBool::new(false),
            close_notify: Notify::new(),
            life_token: CancellationToken::new(),
            socket_token: std::sync::Mutex::new(CancellationToken::new()),
            reconnect_attempts: AtomicU32::new(0),
            metrics: Arc::new(ConnectionMetrics::new()),
            handlers: HandlerSlots::default(),
            heartbeat: std::sync::Mutex::new(None),
            last_error: std::sync::Mutex::new(None),
            last_connected: std::sync::Mutex::new(None),
            pump_handles: std::sync::Mutex::new(Vec::new()),
        };

        Ok(Self(Arc::new(inner)))
    }

    // ---- Lifecycle ---------------------------------------------------

    /// Dial the configured URL. Precondition: state ∈ {Disconnected,
    /// Reconnecting}. See spec §4.1.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.0;
        if !inner.state.try_set_from_any(
            &[ConnState::Disconnected, ConnState::Reconnecting],
            ConnState::Connecting,
        ) {
            return Err(TransportError::StateRejected(inner.state.load().to_string()));
        }
        inner.metrics.inc_connect_attempt();

        let request = match self.build_request() {
            Ok(r) => r,
            Err(e) => {
                inner.state.try_set(ConnState::Connecting, ConnState::Disconnected);
                self.record_error_clone(&e);
                return Err(e);
            }
        };

        let dial = tokio::time::timeout(inner.config.handshake_timeout, connect_async(request)).await;

        let (stream, _response) = match dial {
            Err(_) => {
                inner.state.try_set(ConnState::Connecting, ConnState::Disconnected);
                self.record_error(TransportError::Timeout);
                return Err(TransportError::Timeout);
            }
            Ok(Err(e)) => {
                let err: TransportError = e.into();
                inner.state.try_set(ConnState::Connecting, ConnState::Disconnected);
                self.record_error_clone(&err);
                return Err(err);
            }
            Ok(Ok(pair)) => pair,
        };

        let (sink, source) = stream.split();
        *inner.write_half.lock().await = Some(sink);
        *inner.read_half.lock().await = Some(source);
        let generation = inner.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let socket_token = inner.life_token.child_token();
        *inner.socket_token.lock().expect("socket token mutex poisoned") = socket_token.clone();

        let read_handle = tokio::spawn(pumps::read_pump(self.0.clone(), generation, socket_token.clone()));
        let write_handle = tokio::spawn(pumps::write_pump(self.0.clone(), generation, socket_token.clone()));
        *inner.pump_handles.lock().expect("pump handles mutex poisoned") = vec![read_handle, write_handle];

        let heartbeat = Arc::new(Heartbeat::new(inner.config.ping_period, inner.config.pong_wait));
        heartbeat.spawn(
            inner.write_half.clone(),
            inner.config.write_timeout,
            socket_token,
            inner.reconnect_tx.clone(),
        );
        *inner.heartbeat.lock().expect("heartbeat mutex poisoned") = Some(heartbeat);

        if !inner
            .state
            .try_set_from_any(&[ConnState::Connecting], ConnState::Connected)
        {
            // A concurrent Close/Disconnect raced us to Closing/Closed between
            // the dial finishing and this point. Tear down what we just built
            // and report failure rather than leaving an orphaned socket.
            self.disconnect_internal(None).await;
            return Err(TransportError::StateRejected("closing".to_string()));
        }

        inner.metrics.inc_connect_success();
        inner.reconnect_attempts.store(0, Ordering::Relaxed);
        *inner.last_connected.lock().expect("last_connected mutex poisoned") = Some(Instant::now());
        info!(url = %inner.config.url, generation, "connection established");
        self.fire_on_connect();
        Ok(())
    }

    /// Enqueue `payload` for delivery. Accepted only in `Connected` (§9
    /// Decision 1 — rejects `Send` outside `Connected` for predictability).
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let inner = &self.0;
        if !inner.state.is(ConnState::Connected) {
            return Err(TransportError::StateRejected(inner.state.load().to_string()));
        }
        if let Some(limiter) = &inner.config.rate_limiter {
            if !limiter.wait(&inner.life_token).await {
                return Err(TransportError::Cancelled);
            }
        }

        let sender = {
            let guard = inner.outgoing_tx.lock().await;
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(TransportError::Closed);
        };

        let len = payload.len();
        tokio::select! {
            biased;
            _ = inner.life_token.cancelled() => Err(TransportError::Cancelled),
            sent = tokio::time::timeout(inner.config.write_timeout, sender.send(payload)) => {
                match sent {
                    Err(_) => Err(TransportError::Timeout),
                    Ok(Err(_)) => Err(TransportError::Closed),
                    Ok(Ok(())) => {
                        inner.metrics.record_queued(len);
                        Ok(())
                    }
                }
            }
        }
    }

    /// Send-and-wait-for-drain: waits until the write pump has actually put
    /// `payload` on the wire, not merely enqueued it — `messages_sent` is
    /// bumped only by the write pump (§4.2 step 8), so waiting on it here
    /// observes real transmission rather than queue acceptance.
    pub async fn send_sync(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let before = self.0.metrics.messages_sent.load(Ordering::Acquire);
        self.send(payload).await?;
        loop {
            if self.0.metrics.messages_sent.load(Ordering::Acquire) > before {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
    }

    /// Tear down the current socket and return to `Disconnected`. Idempotent.
    pub async fn disconnect(&self) {
        self.disconnect_internal(None).await;
    }

    pub(crate) async fn disconnect_internal(&self, err: Option<TransportError>) {
        let inner = &self.0;
        if !inner.state.try_set_from_any(
            &[
                ConnState::Connected,
                ConnState::Connecting,
                ConnState::Reconnecting,
                ConnState::Disconnected,
            ],
            ConnState::Closing,
        ) {
            return; // already Closing/Closed — idempotent no-op
        }

        // Cancel the current socket's token so its pumps and heartbeat stop
        // (§4.1 "cancel socketToken"); otherwise the old heartbeat outlives
        // the disconnect, eventually calls itself unhealthy, and re-triggers
        // a reconnect the caller never asked for.
        inner
            .socket_token
            .lock()
            .expect("socket token mutex poisoned")
            .cancel();
        if let Some(hb) = inner.heartbeat.lock().expect("heartbeat mutex poisoned").take() {
            drop(hb);
        }

        shutdown::force_close_socket(inner).await;
        inner.generation.fetch_add(1, Ordering::AcqRel);
        inner.metrics.inc_disconnect();
        if let Some(ref e) = err {
            self.record_error_clone(e);
        }
        let msg = err.map(|e| e.to_string());
        self.fire_on_disconnect(msg);

        inner
            .state
            .try_set(ConnState::Closing, ConnState::Disconnected);
    }

    /// Retire the current socket while holding `Reconnecting` (spec §4.3
    /// "Reconnect-only teardown"). Does not touch the public channels.
    pub(crate) async fn disconnect_for_reconnect(&self) {
        let inner = &self.0;
        let old_token = {
            let mut guard = inner.socket_token.lock().expect("socket token mutex poisoned");
            let old = guard.clone();
            *guard = inner.life_token.child_token();
            old
        };
        old_token.cancel();
        shutdown::force_close_socket(inner).await;
        inner.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Exactly-once teardown of the whole Connection (spec §4.3).
    pub async fn close(&self) {
        shutdown::close_sequence(&self.0).await;
    }

    /// Start the auto-reconnect task. No-op if already started.
    pub fn start_auto_reconnect(&self) {
        let Some(rx) = self.0.reconnect_rx.try_lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        crate::reconnect::spawn(self.clone(), rx);
    }

    pub(crate) fn trigger_reconnect(&self) -> bool {
        let inner = &self.0;
        if inner.state.try_set(ConnState::Connected, ConnState::Reconnecting) {
            let _ = inner.reconnect_tx.try_send(());
            true
        } else {
            false
        }
    }

    /// Re-arm the reconnect signal without a CAS — used by the auto-reconnect
    /// task when a retry attempt fails and state is already `Reconnecting`.
    pub(crate) fn retry_reconnect_signal(&self) {
        let _ = self.0.reconnect_tx.try_send(());
    }

    pub(crate) async fn life_cancelled(&self) {
        self.0.life_token.cancelled().await;
    }

    pub(crate) fn max_reconnect_attempts(&self) -> u32 {
        self.0.config.max_reconnect_attempts
    }

    pub(crate) fn bump_reconnect_attempts(&self) -> u32 {
        self.0.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reconnect_backoff_params(&self) -> (std::time::Duration, std::time::Duration, f64) {
        (
            self.0.config.initial_reconnect_delay,
            self.0.config.max_reconnect_delay,
            self.0.config.reconnect_backoff_multiplier,
        )
    }

    /// Give up after `maxAttempts` consecutive failures (§4.4 step 1).
    pub(crate) fn settle_disconnected_after_exhaustion(&self) {
        self.0
            .state
            .try_set(ConnState::Reconnecting, ConnState::Disconnected);
    }

    // ---- Introspection -------------------------------------------------

    pub fn state(&self) -> ConnState {
        self.0.state.load()
    }

    pub fn is_connected(&self) -> bool {
        self.0.state.is(ConnState::Connected)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.0.state.is(ConnState::Reconnecting)
    }

    pub fn last_error(&self) -> Option<String> {
        self.0.last_error.lock().expect("last_error mutex poisoned").clone()
    }

    pub fn metrics(&self) -> ConnectionMetricsSnapshot {
        self.0.metrics.snapshot()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.0.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn url(&self) -> &str {
        &self.0.config.url
    }

    pub fn last_connected(&self) -> Option<Instant> {
        *self.0.last_connected.lock().expect("last_connected mutex poisoned")
    }

    pub fn is_healthy(&self) -> bool {
        self.0
            .heartbeat
            .lock()
            .expect("heartbeat mutex poisoned")
            .as_ref()
            .map(|h| h.is_healthy())
            .unwrap_or(false)
    }

    // ---- Handlers --------------------------------------------------------

    pub fn set_on_connect(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.0.handlers.on_connect.write().expect("handler lock poisoned") = Some(Arc::new(f));
    }

    pub fn set_on_disconnect(&self, f: impl Fn(Option<String>) + Send + Sync + 'static) {
        *self.0.handlers.on_disconnect.write().expect("handler lock poisoned") = Some(Arc::new(f));
    }

    pub fn set_on_message(&self, f: impl Fn(Vec<u8>) + Send + Sync + 'static) {
        *self.0.handlers.on_message.write().expect("handler lock poisoned") = Some(Arc::new(f));
    }

    pub fn set_on_error(&self, f: impl Fn(&TransportError) + Send + Sync + 'static) {
        *self.0.handlers.on_error.write().expect("handler lock poisoned") = Some(Arc::new(f));
    }

    fn fire_on_connect(&self) {
        let handler = self.0.handlers.on_connect.read().expect("handler lock poisoned").clone();
        if let Some(f) = handler {
            f();
        }
    }

    fn fire_on_disconnect(&self, err: Option<String>) {
        let handler = self
            .0
            .handlers
            .on_disconnect
            .read()
            .expect("handler lock poisoned")
            .clone();
        if let Some(f) = handler {
            f(err);
        }
    }

    pub(crate) fn fire_on_message(&self, bytes: Vec<u8>) {
        let handler = self.0.handlers.on_message.read().expect("handler lock poisoned").clone();
        if let Some(f) = handler {
            f(bytes);
        }
    }

    pub(crate) fn fire_on_error(&self, err: &TransportError) {
        warn!(error = %err, "connection error");
        let handler = self.0.handlers.on_error.read().expect("handler lock poisoned").clone();
        if let Some(f) = handler {
            f(err);
        }
    }

    fn record_error_clone(&self, err: &TransportError) {
        *self.0.last_error.lock().expect("last_error mutex poisoned") = Some(err.to_string());
        self.0.metrics.inc_error();
        if !is_benign_pump_exit(err) {
            self.fire_on_error(err);
        }
    }

    fn record_error(&self, err: TransportError) {
        self.record_error_clone(&err);
    }

    pub(crate) fn headers_map(&self) -> &HashMap<String, String> {
        &self.0.config.headers
    }

    /// Build the upgrade request, layering configured `Headers` onto the
    /// URL's default request (§6 parameter table).
    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::http::Request<()>, TransportError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};

        let mut request = self
            .0
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConfigInvalid(e.to_string()))?;

        for (name, value) in self.headers_map() {
            let header_name = HeaderName::try_from(name.as_str())
                .map_err(|e| TransportError::ConfigInvalid(format!("bad header name {name}: {e}")))?;
            let header_value = HeaderValue::try_from(value.as_str())
                .map_err(|e| TransportError::ConfigInvalid(format!("bad header value for {name}: {e}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        Ok(request)
    }
}
