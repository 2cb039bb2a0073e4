//! Error types for the application

use thiserror::Error;

/// Result type alias using our BotError
pub type Result<T> = std::result::Result<T, BotError>;

/// Main error type for trading client operations
#[derive(Error, Debug)]
pub enum BotError {
    /// WebSocket connection errors
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    /// WebSocket send/receive errors
    #[error("WebSocket communication error: {0}")]
    WebSocketCommunication(String),

    /// The streaming connection is gone; fatal for the session
    #[error("Streaming connection lost: {0}")]
    ConnectionLost(String),

    /// HTTP request errors
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON parsing error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Token or approval key acquisition failed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Invalid API response
    #[error("Invalid API response: {0}")]
    InvalidResponse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The venue rejected an order synchronously
    #[error("Order rejected: {0}")]
    OrderRejected(String),

    /// A streamed frame could not be decoded
    #[error("Frame decode error: {0}")]
    FrameDecode(#[from] FrameDecodeError),

    /// A bounded wait elapsed without the awaited update
    #[error("Wait timed out: {0}")]
    WaitTimeout(String),

    /// The session deadline passed while waiting; not retryable
    ///
    /// The waits and loops report this as a value instead
    /// (`TradeWait::DeadlineReached`, `StopReason::DeadlineReached`), since
    /// reaching the deadline still leads to a sell. The variant is kept for
    /// callers that want it as an error.
    #[error("Session deadline reached")]
    SessionDeadlineReached,

    /// A sell loop finished with shares left over
    #[error("Incomplete liquidation of {code}: sold {sold} of {requested}")]
    IncompleteLiquidation {
        code: String,
        requested: i64,
        sold: i64,
    },

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Whether the error ends the session rather than a single attempt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BotError::ConnectionLost(_) | BotError::WebSocketConnection(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BotError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BotError::WebSocketCommunication(err.to_string())
    }
}

/// Per-frame decode failures. Always non-fatal for the receive loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// Fewer `|`-separated fields than the envelope requires
    #[error("expected 4 envelope fields, got {0}")]
    Envelope(usize),

    /// Payload shorter than the highest offset we read
    #[error("{topic} payload has {got} fields, need at least {need}")]
    FieldCount {
        topic: String,
        got: usize,
        need: usize,
    },

    /// A numeric field did not parse
    #[error("{field} is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },

    /// Encrypted payload arrived before the topic's key/IV
    #[error("no key/iv cached for topic {0}")]
    MissingKey(String),

    /// base64, AES or padding failure
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// Control frame that is not valid JSON
    #[error("bad control frame: {0}")]
    Control(String),
}
