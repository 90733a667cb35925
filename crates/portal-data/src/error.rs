use thiserror::Error;

/// HTTP status codes that are never retried.
pub const NON_RETRYABLE_STATUS: [u16; 5] = [400, 401, 403, 404, 422];

/// Unified error type for the portal data layer.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),

    #[error("rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("price service error: {0}")]
    Price(String),
}

impl Error {
    /// Whether the query layer may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(TransportError::Status { status, .. }) => {
                !NON_RETRYABLE_STATUS.contains(status)
            }
            Error::Transport(_) => true,
            Error::RateLimit(_) => true,
            Error::Price(_) => true,
            Error::Batch(_) | Error::Rpc(_) | Error::Decode(_) | Error::Config(_) => false,
        }
    }

    /// HTTP status carried by a transport failure, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Transport(TransportError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

/// Errors raised while moving bytes to and from the node.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response body: {0}")]
    InvalidBody(String),

    #[error("request not sent: {0}")]
    RateLimited(#[from] RateLimitError),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::InvalidBody(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

/// Malformed batch responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch response is not an array")]
    NotAnArray,

    #[error("batch response count mismatch: expected {expected}, got {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("duplicate request id {0} in batch")]
    DuplicateId(u64),

    #[error("response id {0} does not match any request")]
    UnknownId(u64),

    #[error("malformed response entry: {0}")]
    MalformedResponse(String),
}

/// JSON-RPC level failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{method} (request #{position}) failed with code {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub method: String,
    /// Zero-based position of the failing request in the caller's order.
    pub position: usize,
}

/// Errors from the client-side token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("request waited {waited_ms}ms in the rate limiter queue")]
    QueueTimeout { waited_ms: u64 },

    #[error("rate limiter dropped the request")]
    Dropped,
}

/// Storage failures. Logged by the persistence layer, never returned from
/// its best-effort operations.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("serialization failed for '{key}': {message}")]
    Serialize { key: String, message: String },

    #[error("storage quota exceeded writing '{key}' ({size} bytes)")]
    QuotaExceeded { key: String, size: usize },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(err: std::io::Error) -> Self {
        PersistenceError::Io(err.to_string())
    }
}
