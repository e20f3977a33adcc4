//! Client error types.

use std::time::Duration;

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("no acknowledgment within {0:?}")]
    AckTimeout(Duration),

    #[error("aborted: {0}")]
    Aborted(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("signer error: {0}")]
    Signer(#[from] nostr::SignerError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether this error came from a cancellation signal.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
