//! Command queues the accelerator submits work to
//!
//! A [`CommandBuffer`] is consumed by [`CommandQueue::commit`], so it can run
//! at most once. To retry, the scheduler builds a new one from the
//! invocation record.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, instrument, trace};

use crate::error::{Result, TensorError};
use crate::tensor::kernels::{self, ElementwiseParams, KernelName};
use crate::tensor::TensorId;

/// Device-resident storage for one tensor
pub trait DeviceBuffer: Send + Sync {
    /// Size in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the whole buffer. `bytes` must match [`DeviceBuffer::len`].
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Copy the whole buffer into `out`
    fn read(&self, out: &mut [u8]) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// A compiled device program for one kernel name
pub trait Kernel: Send + Sync {
    fn name(&self) -> KernelName;

    fn as_any(&self) -> &dyn Any;
}

/// Identifies one submission. Stale once the submission completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferId(pub u64);

impl fmt::Display for CommandBufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb{}", self.0)
    }
}

/// Outcome reported by the device for one command buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Failed(String),
}

pub type CompletionHandler = Box<dyn FnOnce(CommandBufferId, Completion) + Send>;

/// One encoded kernel launch, ready for submission
pub struct CommandBuffer {
    id: CommandBufferId,
    label: TensorId,
    kernel: Arc<dyn Kernel>,
    inputs: Vec<Arc<dyn DeviceBuffer>>,
    output: Arc<dyn DeviceBuffer>,
    count: usize,
    on_complete: CompletionHandler,
}

impl CommandBuffer {
    pub fn new(
        id: CommandBufferId,
        label: TensorId,
        kernel: Arc<dyn Kernel>,
        inputs: Vec<Arc<dyn DeviceBuffer>>,
        output: Arc<dyn DeviceBuffer>,
        count: usize,
        on_complete: CompletionHandler,
    ) -> Self {
        Self {
            id,
            label,
            kernel,
            inputs,
            output,
            count,
            on_complete,
        }
    }

    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    /// Tensor the command buffer produces
    pub fn label(&self) -> TensorId {
        self.label
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn inputs(&self) -> &[Arc<dyn DeviceBuffer>] {
        &self.inputs
    }

    pub fn output(&self) -> &Arc<dyn DeviceBuffer> {
        &self.output
    }

    /// Elements to produce
    pub fn count(&self) -> usize {
        self.count
    }

    /// Deliver the device's verdict. Consumes the command buffer.
    pub fn complete(self, completion: Completion) {
        (self.on_complete)(self.id, completion)
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("kernel", &self.kernel.name().to_string())
            .field("count", &self.count)
            .finish()
    }
}

/// An asynchronous, device-managed execution queue
///
/// Implementations must not invoke a command buffer's completion handler
/// before `commit` has returned.
pub trait CommandQueue: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate an uninitialised buffer of `len` bytes
    fn new_buffer(&self, len: usize) -> Result<Arc<dyn DeviceBuffer>>;

    /// Resolve and compile the program for `kernel`
    fn load_kernel(&self, kernel: &KernelName) -> Result<Arc<dyn Kernel>>;

    /// Hand a command buffer to the device
    fn commit(&self, command: CommandBuffer) -> Result<()>;
}

// ============================================================================
// Software queue
// ============================================================================

/// Host memory standing in for device memory
pub struct HostBuffer {
    data: RwLock<Vec<u8>>,
}

impl HostBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; len]),
        }
    }
}

impl DeviceBuffer for HostBuffer {
    fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.len() != bytes.len() {
            return Err(TensorError::BufferLength {
                expected: data.len(),
                got: bytes.len(),
            });
        }
        data.copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> Result<()> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        if data.len() != out.len() {
            return Err(TensorError::BufferLength {
                expected: data.len(),
                got: out.len(),
            });
        }
        out.copy_from_slice(&data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Host kernel resolved from the elementwise library
pub struct HostKernel {
    name: KernelName,
}

impl Kernel for HostKernel {
    fn name(&self) -> KernelName {
        self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Executes command buffers on a pool of worker threads.
///
/// Independent submissions may finish in any order when more than one worker
/// is running.
pub struct SoftwareQueue {
    sender: Option<Sender<CommandBuffer>>,
    workers: Vec<JoinHandle<()>>,
    pending_faults: Arc<AtomicUsize>,
}

impl SoftwareQueue {
    pub fn new(workers: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<CommandBuffer>();
        let pending_faults = Arc::new(AtomicUsize::new(0));

        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let faults = Arc::clone(&pending_faults);
                thread::Builder::new()
                    .name(format!("tensorlib-queue-{index}"))
                    .spawn(move || {
                        for command in receiver.iter() {
                            execute(command, &faults);
                        }
                    })
            })
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| TensorError::Device(format!("failed to spawn queue worker: {e}")))?;

        Ok(Self {
            sender: Some(sender),
            workers,
            pending_faults,
        })
    }

    /// Make the next `n` executed command buffers report an error
    pub fn inject_failures(&self, n: usize) {
        self.pending_faults.fetch_add(n, Ordering::SeqCst);
    }

    pub fn pending_faults(&self) -> usize {
        self.pending_faults.load(Ordering::SeqCst)
    }
}

fn take_fault(faults: &AtomicUsize) -> bool {
    faults
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn run_host(command: &CommandBuffer) -> std::result::Result<(), String> {
    let kernel = command
        .kernel()
        .as_any()
        .downcast_ref::<HostKernel>()
        .ok_or("kernel was not compiled for the software queue")?;

    let inputs = command
        .inputs()
        .iter()
        .map(|buffer| {
            let mut bytes = vec![0; buffer.len()];
            buffer.read(&mut bytes).map(|_| bytes)
        })
        .collect::<Result<Vec<Vec<u8>>>>()
        .map_err(|e| e.to_string())?;
    let slices: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();

    let out = kernels::execute(ElementwiseParams {
        kernel: kernel.name,
        inputs: &slices,
        count: command.count(),
    })
    .map_err(|e| e.to_string())?;

    command.output().write(&out).map_err(|e| e.to_string())
}

#[instrument(skip_all, fields(id = %command.id(), label = %command.label()))]
fn execute(command: CommandBuffer, faults: &AtomicUsize) {
    let completion = if take_fault(faults) {
        Completion::Failed("injected device fault".to_string())
    } else {
        match run_host(&command) {
            Ok(()) => Completion::Completed,
            Err(message) => Completion::Failed(message),
        }
    };
    trace!(?completion, "command buffer finished");
    command.complete(completion);
}

impl CommandQueue for SoftwareQueue {
    fn name(&self) -> &'static str {
        "software"
    }

    fn new_buffer(&self, len: usize) -> Result<Arc<dyn DeviceBuffer>> {
        Ok(Arc::new(HostBuffer::new(len)))
    }

    fn load_kernel(&self, kernel: &KernelName) -> Result<Arc<dyn Kernel>> {
        debug!(%kernel, "resolved host kernel");
        Ok(Arc::new(HostKernel { name: *kernel }))
    }

    fn commit(&self, command: CommandBuffer) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| TensorError::Device("software queue is shut down".into()))?;
        sender
            .send(command)
            .map_err(|_| TensorError::Device("software queue workers exited".into()))
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop.
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The last scheduler reference can be dropped from a completion
            // handler running on a worker.
            if worker.thread().id() != current {
                let _ = worker.join();
            }
        }
    }
}
