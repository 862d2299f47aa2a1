//! Error types for meshconf

use thiserror::Error;

/// Result type alias using meshconf Error
pub type Result<T> = std::result::Result<T, Error>;

/// meshconf error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Malformed value stored under {key}: {reason}")]
    MalformedValue { key: String, reason: String },

    #[error("Identifier counter missing at key {key}")]
    MissingCounter { key: String },

    #[error("Identifier allocation gave up after {attempts} conflicting attempts")]
    AllocationContention { attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Resolve error: {0}")]
    Resolve(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Node lookup failure for `key`
    pub fn node_not_found(key: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "node".to_string(),
            id: key.into(),
        }
    }

    /// Whether this is a recoverable "nothing stored under that key" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn malformed(key: impl Into<String>, reason: impl ToString) -> Self {
        Error::MalformedValue {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::Crypto(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Crypto(e.to_string())
    }
}
