//! Minimal demonstration of a managed [`Connection`]: connect, send, handle
//! inbound messages, and shut down cleanly on Ctrl-C.
//!
//! Run against any echo-style WebSocket server:
//! `cargo run --example basic_client -- wss://echo.example.com`

use std::env;

use wstransport::{ConnectionConfig, Connection};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .compact()
        .init();

    let url = env::args().nth(1).unwrap_or_else(|| "wss://echo.websocket.org".to_string());

    let mut config = ConnectionConfig::new(url);
    config.max_reconnect_attempts = 5;

    let connection = Connection::new(config)?;

    connection.set_on_connect(|| {
        tracing::info!("connected");
    });
    connection.set_on_disconnect(|err| {
        tracing::warn!(?err, "disconnected");
    });
    connection.set_on_message(|bytes| {
        tracing::info!(len = bytes.len(), "message received");
    });
    connection.set_on_error(|err| {
        tracing::error!(error = %err, "connection error");
    });

    connection.connect().await?;
    connection.start_auto_reconnect();

    connection.send(b"hello".to_vec()).await?;

    tokio::signal::ctrl_c().await?;
    connection.close().await;
    Ok(())
}
