//! Stable error taxonomy for the transport (spec §7).
//!
//! Every variant here is a sentinel callers can branch on; message text is
//! for humans, the variant is for code. Benign pump-exit conditions
//! (`PeerClosed`, `StaleConnection`, `Timeout`) are never logged at `warn!`
//! — see `connection::pumps`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("operation rejected in state {0}")]
    StateRejected(String),

    #[error("cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("rate limited")]
    RateLimited,

    #[error("stale connection (generation mismatch)")]
    StaleConnection,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("network closed: {0}")]
    NetworkClosed(String),

    #[error("timeout")]
    Timeout,

    #[error("auth missing")]
    AuthMissing,

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("token is expired")]
    TokenExpired,

    #[error("token is not valid yet")]
    TokenNotYetValid,

    #[error("invalid issuer")]
    InvalidIssuer,

    #[error("invalid audience")]
    InvalidAudience,

    #[error("empty token")]
    EmptyToken,

    #[error("missing claims")]
    MissingClaims,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("origin rejected")]
    OriginRejected,

    #[error("TLS required")]
    TLSRequired,

    #[error("TLS version too low")]
    TLSVersionLow,

    #[error("connection limit exceeded")]
    ConnectionLimitExceeded,

    #[error("closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::PeerClosed,
            WsError::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
                TransportError::Timeout
            }
            other => TransportError::NetworkClosed(other.to_string()),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TransportError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => TransportError::TokenExpired,
            ErrorKind::ImmatureSignature => TransportError::TokenNotYetValid,
            ErrorKind::InvalidIssuer => TransportError::InvalidIssuer,
            ErrorKind::InvalidAudience => TransportError::InvalidAudience,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                TransportError::InvalidToken("unexpected signing method".to_string())
            }
            other => TransportError::InvalidToken(format!("failed to parse token: {other:?}")),
        }
    }
}

/// `true` for errors a pump should exit on silently (no `on_error` fire).
pub fn is_benign_pump_exit(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::PeerClosed | TransportError::StaleConnection | TransportError::Closed
    )
}
