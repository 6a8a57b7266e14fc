//! Error taxonomy shared by the listener, aggregator and dispatcher.

use thiserror::Error;

/// Errors returned synchronously by the core API.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A listener or worker session could not be established.
    #[error("initialization failed for {id}: {reason}")]
    Initialization { id: String, reason: String },

    #[error("source already registered: {0}")]
    DuplicateSource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every configured worker failed to connect.
    #[error("no worker account could be initialized")]
    NoActiveWorkers,

    /// The facade wires its event streams once.
    #[error("system already started")]
    AlreadyStarted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn init(id: impl Into<String>, reason: impl ToString) -> Self {
        Self::Initialization {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Failure reported by an external collaborator (extractor, platform API).
///
/// The split matters: `Auth` triggers a reconnect attempt, `Transient` is
/// retried implicitly (next poll) or explicitly (task reassignment).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("session rejected: {0}")]
    Auth(String),

    #[error("transient failure: {0}")]
    Transient(String),
}

impl ClientError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => Self::Auth(e.to_string()),
            _ => Self::Transient(e.to_string()),
        }
    }
}
