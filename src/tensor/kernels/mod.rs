//! Elementwise kernel library
//!
//! Kernels are pure functions over tagged byte buffers. They are addressed by
//! name (`"add_f32"`, `"neg_i64"`, ...) so that backends can resolve, compile
//! and cache them without knowing anything about tensors.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::dtype::DType;
use crate::error::TensorError;

pub mod elementwise;
pub mod msl;

pub use elementwise::execute;

/// Elementwise operations with device kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
}

impl ElementwiseOp {
    pub const ALL: [ElementwiseOp; 5] = [
        ElementwiseOp::Add,
        ElementwiseOp::Sub,
        ElementwiseOp::Mul,
        ElementwiseOp::Div,
        ElementwiseOp::Neg,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ElementwiseOp::Add => "add",
            ElementwiseOp::Sub => "sub",
            ElementwiseOp::Mul => "mul",
            ElementwiseOp::Div => "div",
            ElementwiseOp::Neg => "neg",
        }
    }

    /// Number of operand buffers the kernel reads
    pub fn arity(&self) -> usize {
        match self {
            ElementwiseOp::Neg => 1,
            _ => 2,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }
}

/// Dtypes that have elementwise kernels
pub const KERNEL_DTYPES: [DType; 3] = [DType::F32, DType::I32, DType::I64];

/// A resolved kernel name: an operation specialised to one dtype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelName {
    pub op: ElementwiseOp,
    pub dtype: DType,
}

impl KernelName {
    pub fn new(op: ElementwiseOp, dtype: DType) -> Self {
        Self { op, dtype }
    }

    /// All kernel names the library can execute
    pub fn all() -> impl Iterator<Item = KernelName> {
        ElementwiseOp::ALL.into_iter().flat_map(|op| {
            KERNEL_DTYPES
                .into_iter()
                .map(move |dtype| KernelName::new(op, dtype))
        })
    }
}

impl fmt::Display for KernelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.op.name(), self.dtype.repr)
    }
}

impl FromStr for KernelName {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unsupported = || TensorError::UnsupportedOperation(s.to_string());
        let (op, repr) = s.split_once('_').ok_or_else(unsupported)?;
        let op = ElementwiseOp::from_name(op).ok_or_else(unsupported)?;
        let dtype = DType::from_repr(repr).ok_or_else(unsupported)?;
        if !KERNEL_DTYPES.contains(&dtype) {
            return Err(unsupported());
        }
        Ok(KernelName::new(op, dtype))
    }
}

/// Failures raised while a kernel runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("{kernel} expects {expected} operands, got {got}")]
    Arity {
        kernel: KernelName,
        expected: usize,
        got: usize,
    },

    #[error("operand {index} holds {got} bytes, expected {expected}")]
    OperandLength {
        index: usize,
        expected: usize,
        got: usize,
    },

    #[error("integer division by zero at element {index}")]
    DivisionByZero { index: usize },

    #[error("no kernels for dtype {0}")]
    UnsupportedDType(&'static str),
}

/// Inputs for one elementwise kernel launch
///
/// * `kernel` - Which operation and dtype to run
/// * `inputs` - One byte slice per operand, each `count * dtype.bytes` long
/// * `count` - Number of elements to produce
pub struct ElementwiseParams<'a> {
    pub kernel: KernelName,
    pub inputs: &'a [&'a [u8]],
    pub count: usize,
}
