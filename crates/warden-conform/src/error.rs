use std::result::Result as StdResult;

use thiserror::Error;
use warden_core::Error as CoreError;
use warden_engine::EngineError;

/// Result type for conform operations.
pub type Result<T> = StdResult<T, ConformError>;

/// Errors raised by the conform service layer.
#[derive(Debug, Error)]
pub enum ConformError {
    /// A core operation failed.
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// The engine rejected a submission or failed a query.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Reading or writing the configuration file failed.
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid TOML.
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// The configuration could not be serialized.
    #[error("Config serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// The home directory could not be determined.
    #[error("Could not determine home directory")]
    NoHomeDir,
}

impl ConformError {
    /// Determines whether resubmitting the same work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Core(error) => error.is_retryable(),
            Self::Engine(error) => error.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_engine::LockMode;
    use warden_core::{EntityId, ObjectKind, ObjectRef};

    #[test]
    fn test_contention_stays_retryable_through_the_wrapper() {
        let error = ConformError::Engine(EngineError::LockContention {
            reference: ObjectRef::new(ObjectKind::Connector, EntityId(7), "east"),
            wanted: LockMode::Exclusive,
            held: LockMode::Exclusive,
        });
        assert!(error.is_retryable());

        let fixed = ConformError::NoHomeDir;
        assert!(!fixed.is_retryable());
    }
}
