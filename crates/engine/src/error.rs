//! Error types for the engine crate.

use thiserror::Error;

use venc_common::{BufferIndex, EngineError};

use crate::buffer::BufferDescriptor;

/// Buffer pool errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer pool exhausted: all {capacity} slots are allocated")]
    Exhausted { capacity: usize },

    #[error("Bad buffer slot {index}: {reason}")]
    BadParameter {
        index: BufferIndex,
        reason: &'static str,
    },

    #[error("Pool capacity already established with {allocated} slots in use")]
    AlreadyEstablished { allocated: usize },

    #[error("Pool capacity must be non-zero")]
    ZeroCapacity,
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { .. } => EngineError::InsufficientResources(err.to_string()),
            PoolError::AlreadyEstablished { .. } => EngineError::InvalidState,
            PoolError::BadParameter { .. } | PoolError::ZeroCapacity => {
                EngineError::BadParameter(err.to_string())
            }
        }
    }
}

/// A buffer submission that was refused at the entry point.
///
/// The buffer is handed back so ownership never leaks on rejection.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SubmitError {
    pub error: EngineError,
    pub buffer: BufferDescriptor,
}

impl SubmitError {
    pub fn into_buffer(self) -> BufferDescriptor {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_error_display() {
        let err = PoolError::Exhausted { capacity: 4 };
        assert_eq!(err.to_string(), "Buffer pool exhausted: all 4 slots are allocated");
    }

    #[test]
    fn pool_errors_map_to_taxonomy() {
        let err: EngineError = PoolError::Exhausted { capacity: 2 }.into();
        assert!(matches!(err, EngineError::InsufficientResources(_)));

        let err: EngineError = PoolError::BadParameter {
            index: BufferIndex(7),
            reason: "slot is free",
        }
        .into();
        assert!(matches!(err, EngineError::BadParameter(msg) if msg.contains("#7")));
    }
}
