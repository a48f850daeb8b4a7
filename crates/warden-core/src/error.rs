use core::result::Result as CoreResult;

use thiserror::Error;

use crate::refs::EntityKey;

/// Result type for core operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors that can occur in the core library.
#[derive(Debug, Error)]
pub enum Error {
    /// A record lookup by primary key missed.
    #[error("Record not found: {0}")]
    NotFound(EntityKey),

    /// A call to an external system failed.
    #[error("Remote system '{system}' error: {message}")]
    Remote {
        /// Which external system the call targeted.
        system: String,
        /// Failure description reported by the client.
        message: String,
    },

    /// A remote operation targeted an identifier the external system no
    /// longer knows.
    #[error("Remote system '{system}' has no record '{id}'")]
    RemoteMissing {
        /// Which external system the call targeted.
        system: String,
        /// The foreign identifier that was not found.
        id: String,
    },

    /// A commit observed versions that a concurrent commit superseded.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// The store rejected an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Determines whether this error may succeed if retried.
    ///
    /// Returns `true` for transient failures such as remote-system errors
    /// and version conflicts, which a later reconciliation pass resolves.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::Conflict(_))
    }
}
