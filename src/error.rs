//! Unified SDK error types.

use thiserror::Error;

/// Top-level SDK error.
#[derive(Error, Debug)]
pub enum SdkError {
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] WsError),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// HTTP-layer errors.
#[derive(Error, Debug)]
pub enum HttpError {
    #[cfg(feature = "http")]
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid header value for {name}")]
    InvalidHeader { name: &'static str },

    #[error("Failed to encode request: {0}")]
    Encode(String),
}

/// WebSocket errors.
///
/// Caller-input errors (`ScopeConflict`, `InvalidScope`, `Closed`) are
/// returned synchronously. Integrity problems observed on the feed
/// (`AckMismatch`, `SequenceGap`, `UnknownFrame`, `Server`) and connection
/// lifecycle failures (`ConnectionLost`, `ReconnectExhausted`) are delivered
/// to the registered [`EventSink`](crate::ws::EventSink).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WsError {
    #[error("Dial failed: {0}")]
    DialFailure(String),

    #[error("Channel {channel} already subscribed with a different scope")]
    ScopeConflict { channel: String },

    #[error("Invalid scope for channel {channel}: {reason}")]
    InvalidScope { channel: String, reason: String },

    #[error("Subscription ack for {channel} does not match: expected {expected:?}, acknowledged {acknowledged:?}")]
    AckMismatch {
        channel: String,
        expected: Vec<String>,
        acknowledged: Vec<String>,
    },

    #[error("Sequence gap on {channel}: expected {expected}, received {received}")]
    SequenceGap {
        channel: String,
        expected: u64,
        received: u64,
    },

    #[error("Unrecognized frame: {0}")]
    UnknownFrame(String),

    #[error("Client closed")]
    Closed,

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Connection lost: code={code:?} reason={reason}")]
    ConnectionLost { code: Option<u16>, reason: String },

    #[error("Reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Invalid WebSocket URL: {0}")]
    InvalidUrl(String),
}

#[cfg(feature = "ws-native")]
impl From<tokio_tungstenite::tungstenite::Error> for WsError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match err {
            Error::ConnectionClosed => WsError::ConnectionLost {
                code: Some(1000),
                reason: "Connection closed normally".to_string(),
            },
            Error::AlreadyClosed => WsError::NotConnected,
            Error::Url(e) => WsError::InvalidUrl(e.to_string()),
            Error::Http(resp) => WsError::DialFailure(format!("HTTP error: {}", resp.status())),
            Error::HttpFormat(e) => WsError::DialFailure(e.to_string()),
            Error::Io(e) => WsError::ConnectionLost {
                code: None,
                reason: e.to_string(),
            },
            other => WsError::ConnectionLost {
                code: None,
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for WsError {
    fn from(err: serde_json::Error) -> Self {
        WsError::UnknownFrame(err.to_string())
    }
}

impl WsError {
    /// Whether the reconnect policy may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WsError::DialFailure(_) | WsError::ConnectionLost { .. } | WsError::SendFailed(_)
        )
    }
}
