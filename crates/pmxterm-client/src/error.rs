use pmxterm_proto::Verb;
use serde_json::Value;

/// Errors talking to a backend.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed backend message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("backend rejected the request: {0}")]
    Remote(String),
    #[error("unexpected {verb} result: {value}")]
    UnexpectedResult { verb: Verb, value: Value },
    #[error("backend closed the connection")]
    Disconnected,
    #[error("backend is not running")]
    NotRunning,
    #[error("backend is already running")]
    AlreadyRunning,
    #[error("backend failed to start: {0}")]
    Start(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;
