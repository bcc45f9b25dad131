//! Asynchronous accelerator backend
//!
//! Work is recorded by `enqueue_kernel`, submitted by `schedule_realize` and
//! executed by a [`CommandQueue`]: Metal on supported Macs, otherwise the
//! threaded [`SoftwareQueue`].

pub mod metal;
pub mod queue;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug_span, instrument};

use super::backend::{Backend, BackendKind, BackendStats, CommandStatus};
use crate::error::Result;
use crate::tensor::kernels::KernelName;
use crate::tensor::TensorId;

pub use queue::{CommandQueue, SoftwareQueue};
pub use scheduler::{Scheduler, MAX_REQUEUES};

use queue::Kernel;

pub struct AcceleratorBackend {
    scheduler: Arc<Scheduler>,
    programs: Mutex<HashMap<KernelName, Arc<dyn Kernel>>>,
}

impl AcceleratorBackend {
    pub fn new(queue: Arc<dyn CommandQueue>) -> Self {
        Self {
            scheduler: Scheduler::new(queue),
            programs: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the command queue executing this backend's work
    pub fn queue_name(&self) -> &'static str {
        self.scheduler.queue().name()
    }

    /// Resubmit invocations whose last execution failed.
    pub fn requeue(&self) {
        self.scheduler.requeue()
    }

    /// Compile `kernel` on first use; later calls hit the cache.
    fn program(&self, kernel: &KernelName) -> Result<Arc<dyn Kernel>> {
        let mut programs = self.programs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(program) = programs.get(kernel) {
            return Ok(Arc::clone(program));
        }
        let program = debug_span!("CompileKernel", %kernel)
            .in_scope(|| self.scheduler.queue().load_kernel(kernel))?;
        programs.insert(*kernel, Arc::clone(&program));
        Ok(program)
    }
}

impl Backend for AcceleratorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Accelerator
    }

    fn assign(&self, id: TensorId, bytes: &[u8]) -> Result<()> {
        self.scheduler.assign(id, bytes)
    }

    fn copy_to_host(&self, id: TensorId, out: &mut [u8]) -> Result<()> {
        self.scheduler.copy_to_host(id, out)
    }

    #[instrument(skip(self, operands))]
    fn enqueue_kernel(&self, operands: &[TensorId], result: TensorId, op: &str) -> Result<()> {
        let kernel: KernelName = op.parse()?;
        let program = self.program(&kernel)?;
        self.scheduler.enqueue(operands, result, program)
    }

    fn schedule_realize(&self, id: TensorId) -> Result<()> {
        self.scheduler.schedule(id);
        Ok(())
    }

    fn wait_for(&self, id: TensorId) -> Result<()> {
        self.scheduler.wait_for(id)
    }

    fn get_cmdbuf_status(&self, id: TensorId) -> CommandStatus {
        self.scheduler.status(id)
    }

    fn release(&self, id: TensorId) {
        self.scheduler.release(id)
    }

    fn has_buffer(&self, id: TensorId) -> bool {
        self.scheduler.has_buffer(id)
    }

    fn has_invocation(&self, id: TensorId) -> bool {
        self.scheduler.has_invocation(id)
    }

    fn stats(&self) -> BackendStats {
        self.scheduler.stats()
    }

    fn submission_log(&self) -> Vec<TensorId> {
        self.scheduler.submission_log()
    }
}
