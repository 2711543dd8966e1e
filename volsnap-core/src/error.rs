/*!
Error types for the volsnap engine.
*/

use thiserror::Error;
use volsnap_retry::{RetryError, RetryableError};

/// Result type used throughout the volsnap core.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur while reconciling snapshots.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Transient backend failure (network, timeout, throttling)
    #[error("Backend error from {backend}: {message}")]
    Backend { backend: String, message: String },

    /// The backend rejected the request; retrying unchanged will not help
    #[error("Backend {backend} rejected the request: {message}")]
    Rejected { backend: String, message: String },

    /// The record belongs to another engine instance
    #[error("Snapshot {key} is owned by controller '{owner}'")]
    NotOwned { key: String, owner: String },

    /// Record is missing required fields or has an invalid identity
    #[error("Malformed record: {0}")]
    Malformed(String),

    /// The source volume of a request cannot be resolved (yet)
    #[error("Cannot resolve source volume: {0}")]
    SourceUnresolvable(String),

    /// No plugin is registered for the backend kind
    #[error("Unsupported backend: {0}")]
    UnsupportedBackend(String),

    /// Object store failure
    #[error("Object store error: {0}")]
    Store(String),

    /// Record does not exist in the object store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists in the object store
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors during backend or file-store operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Retries or polls ran out
    #[error("Retry error: {0}")]
    Retry(#[from] RetryError),
}

impl SnapshotError {
    /// Create a new transient backend error
    pub fn backend<B: Into<String>, S: Into<String>>(backend: B, msg: S) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a new permanent backend rejection
    pub fn rejected<B: Into<String>, S: Into<String>>(backend: B, msg: S) -> Self {
        Self::Rejected {
            backend: backend.into(),
            message: msg.into(),
        }
    }

    /// Create a new malformed record error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a new unresolvable source error
    pub fn source_unresolvable<S: Into<String>>(msg: S) -> Self {
        Self::SourceUnresolvable(msg.into())
    }

    /// Create a new object store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_not_owned(&self) -> bool {
        matches!(self, Self::NotOwned { .. })
    }

    /// Convert into a [`RetryError`] classified by [`RetryableError::is_transient`]
    pub fn into_retry(self, operation: &'static str) -> RetryError {
        if self.is_transient() {
            RetryError::Transient {
                operation,
                source: Box::new(self),
            }
        } else {
            RetryError::Permanent {
                operation,
                source: Box::new(self),
            }
        }
    }

    /// Recover the original error from a permanent [`RetryError`]
    ///
    /// Exhausted retries stay wrapped in [`SnapshotError::Retry`].
    pub fn from_retry(err: RetryError) -> Self {
        match err {
            RetryError::Permanent { operation, source } => match source.downcast::<Self>() {
                Ok(original) => *original,
                Err(source) => Self::Retry(RetryError::Permanent { operation, source }),
            },
            other => Self::Retry(other),
        }
    }
}

impl RetryableError for SnapshotError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Backend { .. } | Self::Store(_) | Self::Io(_) | Self::Retry(_)
        )
    }
}
