//! Central error types for the engine (thiserror-based).

use thiserror::Error;

use crate::types::ComponentState;

/// Error taxonomy of the component.
///
/// Parameter and state-precondition errors are returned synchronously from
/// the entry point that detected them. `Hardware` and `PortUnpopulated` also
/// travel asynchronously as error events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Bad port index")]
    BadPortIndex,

    #[error("Operation not allowed in the current state")]
    InvalidState,

    #[error("Illegal state transition: {from} -> {to}")]
    IncorrectStateTransition {
        from: ComponentState,
        to: ComponentState,
    },

    #[error("Component is already in state {0}")]
    SameState(ComponentState),

    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Port {0} lost a buffer while it had to stay populated")]
    PortUnpopulated(crate::types::PortIndex),
}

impl EngineError {
    /// Whether this error puts the component into the `Invalid` state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }
}

/// Configuration loading / validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid codec parameters: {0}")]
    Codec(String),

    #[error("Invalid {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::BadParameter(err.to_string())
    }
}

/// Errors from shared memory regions and their allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Memory allocation failed: {size} bytes")]
    AllocationFailed { size: usize },

    #[error("Access out of bounds: offset {offset} + len {len} exceeds region of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

impl From<MemoryError> for EngineError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::AllocationFailed { .. } => {
                EngineError::InsufficientResources(err.to_string())
            }
            MemoryError::OutOfBounds { .. } => EngineError::BadParameter(err.to_string()),
        }
    }
}

/// Convenience result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortIndex;

    #[test]
    fn transition_error_names_both_states() {
        let err = EngineError::IncorrectStateTransition {
            from: ComponentState::Loaded,
            to: ComponentState::Executing,
        };
        assert_eq!(err.to_string(), "Illegal state transition: Loaded -> Executing");
    }

    #[test]
    fn only_hardware_is_fatal() {
        assert!(EngineError::Hardware("bus".into()).is_fatal());
        assert!(!EngineError::InvalidState.is_fatal());
        assert!(!EngineError::PortUnpopulated(PortIndex::Input).is_fatal());
    }

    #[test]
    fn memory_errors_map_to_taxonomy() {
        let err: EngineError = MemoryError::AllocationFailed { size: 64 }.into();
        assert!(matches!(err, EngineError::InsufficientResources(_)));
        let err: EngineError = MemoryError::OutOfBounds {
            offset: 8,
            len: 16,
            size: 10,
        }
        .into();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }

    #[test]
    fn config_error_maps_to_bad_parameter() {
        let err: EngineError = ConfigError::Codec("level".into()).into();
        assert!(matches!(err, EngineError::BadParameter(msg) if msg.contains("level")));
    }
}
