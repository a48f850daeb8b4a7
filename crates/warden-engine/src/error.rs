use std::result::Result as StdResult;

use thiserror::Error;
use warden_core::Error as CoreError;
use warden_core::ObjectRef;

use crate::job::JobId;
use crate::lock::LockMode;

/// Result type for engine operations.
pub type Result<T> = StdResult<T, EngineError>;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A core operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// A reference is already held in an incompatible mode.
    #[error("Lock contention on {reference}: wanted {wanted:?}, held {held:?}")]
    LockContention {
        /// The contended reference.
        reference: ObjectRef,
        /// The mode the caller asked for.
        wanted: LockMode,
        /// The mode currently granted.
        held: LockMode,
    },

    /// A lock operation targeted a reference the owner does not hold.
    #[error("Lock on {reference} is not held by the caller")]
    LockNotHeld {
        /// The reference the operation targeted.
        reference: ObjectRef,
    },

    /// The submitted graph contains a dependency cycle.
    #[error("Cyclic dependency detected in task graph")]
    CyclicGraph,

    /// A job id is unknown to the engine.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The engine no longer accepts submissions.
    #[error("Engine is shut down")]
    EngineStopped,

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Determines whether this error may succeed if retried.
    ///
    /// Lock contention clears once the holding job releases; core errors
    /// delegate to their own classification.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockContention { .. } => true,
            Self::Core(error) => error.is_retryable(),
            _ => false,
        }
    }
}
