//! Device adapter errors.

use thiserror::Error;

use venc_common::{BufferIndex, EngineError, PortIndex};

/// Failures reported by a `DeviceAdapter`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device is not open")]
    NotOpen,

    #[error("Device operation failed: {0}")]
    Hardware(String),

    #[error("Buffer {index} is not registered on the {port} port")]
    UnregisteredBuffer { port: PortIndex, index: BufferIndex },

    #[error("Buffer {index} is already registered on the {port} port")]
    AlreadyRegistered { port: PortIndex, index: BufferIndex },

    #[error("Payload of {len} bytes at offset {offset} exceeds buffer of {capacity} bytes")]
    BadLength {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("Unsupported by device: {0}")]
    Unsupported(String),
}

impl From<DeviceError> for EngineError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Unsupported(what) => EngineError::Unsupported(what),
            DeviceError::BadLength { .. } => EngineError::BadParameter(err.to_string()),
            other => EngineError::Hardware(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = DeviceError::UnregisteredBuffer {
            port: PortIndex::Output,
            index: BufferIndex(3),
        };
        assert_eq!(err.to_string(), "Buffer #3 is not registered on the output port");
    }

    #[test]
    fn maps_into_engine_taxonomy() {
        let err: EngineError = DeviceError::NotOpen.into();
        assert!(err.is_fatal());

        let err: EngineError = DeviceError::Unsupported("probe".into()).into();
        assert_eq!(err, EngineError::Unsupported("probe".into()));

        let err: EngineError = DeviceError::BadLength {
            offset: 0,
            len: 10,
            capacity: 4,
        }
        .into();
        assert!(matches!(err, EngineError::BadParameter(_)));
    }
}
