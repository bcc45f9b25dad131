//! A minimal tensor engine with deferred, device-scheduled execution
//!
//! Operators on [`Tensor`] only record elementwise kernels. Work runs when a
//! tensor is realized, either synchronously on the `"cpu"` device or through
//! the command queue behind the `"gpu"` device, which retries a failed
//! execution once before reporting it.

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod runtime;
pub mod tensor;

// Re-export commonly used types for convenience
pub use config::{QueueKind, RuntimeConfig};
pub use dtype::{ByteBuffer, DType, Element};
pub use error::{Result, TensorError};
pub use runtime::Runtime;
pub use tensor::{RealizationState, Tensor, TensorId};
