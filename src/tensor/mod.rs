//! Tensor handles, the record registry and the elementwise kernel library
//!
//! This module provides the `Tensor` type and the operators that record work
//! on it, along with the registry that owns every tensor record.

mod core;
pub mod kernels;
pub mod registry;

pub use self::core::Tensor;
pub use registry::{RealizationState, TensorId, TensorRecord, TensorRegistry};
