//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

use crate::tensor::TensorId;

/// Errors raised by tensor construction, operators, backends and the scheduler.
///
/// Everything except [`TensorError::Execution`] is a synchronous signal of
/// misuse and is never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("operands live on different devices: {left} and {right}")]
    MixedDevice { left: String, right: String },

    #[error("unknown tensor {0}")]
    UnknownTensor(TensorId),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("kernel execution failed for {id}: {message}")]
    Execution { id: TensorId, message: String },

    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: &'static str,
        got: &'static str,
    },

    #[error("buffer length mismatch: expected {expected} bytes, got {got}")]
    BufferLength { expected: usize, got: usize },

    #[error("device failure: {0}")]
    Device(String),
}

impl TensorError {
    pub fn execution(id: TensorId, message: impl Into<String>) -> Self {
        TensorError::Execution {
            id,
            message: message.into(),
        }
    }

    /// True for the only error class that a requeue may recover from.
    pub fn is_execution(&self) -> bool {
        matches!(self, TensorError::Execution { .. })
    }
}

pub type Result<T> = std::result::Result<T, TensorError>;
