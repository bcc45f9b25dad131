//! Backend capability interface
//!
//! A backend owns device-side storage for tensors (keyed by [`TensorId`]) and
//! the kernel invocations that produce them. Tensors never hand backends a
//! reference to themselves; everything crosses this boundary by id.

use crate::error::Result;
use crate::tensor::TensorId;

/// Backend family, used as the device's variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Synchronous host execution
    Cpu,
    /// Asynchronous execution on a command queue
    Accelerator,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Cpu => "CPU",
            BackendKind::Accelerator => "Accelerator",
        }
    }
}

/// Completion status of the invocation producing a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandStatus {
    /// Recorded but not submitted, or not tracked at all
    Idle,
    /// Submitted, or waiting on operands before submission
    Busy,
    /// Output bytes are valid
    Done,
    /// Output bytes are not guaranteed
    Error,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Done | CommandStatus::Error)
    }
}

/// Counters describing the work a backend has performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Kernel executions handed to the device (including resubmissions)
    pub submissions: u64,
    /// Executions that finished successfully
    pub completions: u64,
    /// Executions that reported an error
    pub failures: u64,
    /// Invocations rebuilt and resubmitted after an error
    pub requeues: u64,
}

/// Storage and execution capabilities every device provides
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Write host bytes into device storage for `id`, allocating on first use.
    fn assign(&self, id: TensorId, bytes: &[u8]) -> Result<()>;

    /// Block until `id` is ready, then copy its bytes into `out`.
    fn copy_to_host(&self, id: TensorId, out: &mut [u8]) -> Result<()>;

    /// Record that `result` is produced by kernel `op` over `operands`.
    ///
    /// Never blocks. Only synchronous backends execute here.
    fn enqueue_kernel(&self, operands: &[TensorId], result: TensorId, op: &str) -> Result<()>;

    /// Submit the pending invocation for `id`. Idempotent; unknown ids are ignored.
    fn schedule_realize(&self, id: TensorId) -> Result<()>;

    /// Block until the invocation for `id` reaches a terminal status.
    fn wait_for(&self, id: TensorId) -> Result<()>;

    /// Non-blocking status poll. Unknown ids report [`CommandStatus::Idle`].
    fn get_cmdbuf_status(&self, id: TensorId) -> CommandStatus;

    /// Drop storage and any invocation for `id`.
    fn release(&self, id: TensorId);

    /// Whether the backend holds storage for `id`
    fn has_buffer(&self, id: TensorId) -> bool;

    /// Whether an invocation record exists for `id`
    fn has_invocation(&self, id: TensorId) -> bool;

    fn stats(&self) -> BackendStats;

    /// Result ids in the order their kernels were submitted
    fn submission_log(&self) -> Vec<TensorId>;
}
