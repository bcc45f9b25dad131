use std::sync::Arc;

use super::queue::CommandQueue;
use crate::error::{Result, TensorError};

// ============================================================================
// Metal Queue (macOS only, feature-gated)
// ============================================================================

#[cfg(all(target_os = "macos", feature = "metal"))]
pub(crate) mod metal_queue {
    use std::any::Any;
    use std::ffi::c_void;
    use std::ptr::NonNull;
    use std::sync::{Arc, OnceLock};
    use std::thread;

    use objc2::rc::Retained;
    use objc2::runtime::ProtocolObject;
    use objc2_foundation::NSString;
    use objc2_metal::{
        MTLBuffer, MTLCommandBuffer, MTLCommandBufferStatus, MTLCommandEncoder, MTLCommandQueue,
        MTLComputeCommandEncoder, MTLComputePipelineState, MTLCreateSystemDefaultDevice,
        MTLDevice, MTLLibrary, MTLResourceOptions, MTLSize,
    };
    use tracing::{debug_span, instrument, trace};

    use crate::device::accelerator::queue::{
        CommandBuffer, CommandQueue, Completion, DeviceBuffer, Kernel,
    };
    use crate::error::{Result, TensorError};
    use crate::tensor::kernels::{msl, KernelName};

    pub struct MetalQueue {
        device: Retained<ProtocolObject<dyn MTLDevice>>,
        command_queue: Retained<ProtocolObject<dyn MTLCommandQueue>>,
    }

    // SAFETY: MTLDevice and MTLCommandQueue are documented as thread-safe.
    unsafe impl Send for MetalQueue {}
    unsafe impl Sync for MetalQueue {}

    impl MetalQueue {
        pub fn new() -> Result<Self> {
            let device = MTLCreateSystemDefaultDevice()
                .ok_or_else(|| TensorError::Device("No Metal device found".into()))?;
            let command_queue = device
                .newCommandQueue()
                .ok_or_else(|| TensorError::Device("Failed to create command queue".into()))?;
            Ok(Self {
                device,
                command_queue,
            })
        }
    }

    pub(crate) fn detect_metal() -> bool {
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| {
            debug_span!("DetectMetalDevice").in_scope(|| MTLCreateSystemDefaultDevice().is_some())
        })
    }

    /// Shared-storage buffer visible to both host and GPU
    pub struct MetalBuffer {
        buffer: Retained<ProtocolObject<dyn MTLBuffer>>,
        len: usize,
    }

    // SAFETY: buffer contents are only touched through `read`/`write`, and the
    // scheduler never writes a buffer while a command buffer is using it.
    unsafe impl Send for MetalBuffer {}
    unsafe impl Sync for MetalBuffer {}

    impl DeviceBuffer for MetalBuffer {
        fn len(&self) -> usize {
            self.len
        }

        fn write(&self, bytes: &[u8]) -> Result<()> {
            if bytes.len() != self.len {
                return Err(TensorError::BufferLength {
                    expected: self.len,
                    got: bytes.len(),
                });
            }
            unsafe {
                let dst = self.buffer.contents().as_ptr() as *mut u8;
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            }
            Ok(())
        }

        fn read(&self, out: &mut [u8]) -> Result<()> {
            if out.len() != self.len {
                return Err(TensorError::BufferLength {
                    expected: self.len,
                    got: out.len(),
                });
            }
            unsafe {
                let src = self.buffer.contents().as_ptr() as *const u8;
                std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len());
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub struct MetalKernel {
        name: KernelName,
        pipeline: Retained<ProtocolObject<dyn MTLComputePipelineState>>,
    }

    // SAFETY: compute pipeline states are immutable and thread-safe.
    unsafe impl Send for MetalKernel {}
    unsafe impl Sync for MetalKernel {}

    impl Kernel for MetalKernel {
        fn name(&self) -> KernelName {
            self.name
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct InFlight {
        command_buffer: Retained<ProtocolObject<dyn MTLCommandBuffer>>,
        /// Set by integer division on a zero divisor
        fault: Option<Retained<ProtocolObject<dyn MTLBuffer>>>,
    }

    // SAFETY: waiting on and querying a committed command buffer is thread-safe,
    // and the fault buffer is only read after the GPU has finished with it.
    unsafe impl Send for InFlight {}

    impl InFlight {
        fn wait(self) -> Completion {
            self.command_buffer.waitUntilCompleted();
            match self.command_buffer.status() {
                MTLCommandBufferStatus::Completed => {}
                status => return Completion::Failed(format!("command buffer status {status:?}")),
            }
            let faulted = self.fault.is_some_and(|fault| {
                let flag: u32 = unsafe { (fault.contents().as_ptr() as *const u32).read() };
                flag != 0
            });
            if faulted {
                Completion::Failed("integer division by zero".into())
            } else {
                Completion::Completed
            }
        }
    }

    /// Deliver the completion from a waiter thread, never from inside `commit`.
    fn spawn_waiter(command: CommandBuffer, in_flight: Option<InFlight>) -> Result<()> {
        thread::Builder::new()
            .name(format!("tensorlib-metal-{}", command.id()))
            .spawn(move || {
                let completion = in_flight.map_or(Completion::Completed, InFlight::wait);
                trace!(?completion, "metal command buffer finished");
                command.complete(completion);
            })
            .map_err(|e| TensorError::Device(format!("failed to spawn waiter: {e}")))?;
        Ok(())
    }

    fn downcast_buffer(buffer: &Arc<dyn DeviceBuffer>) -> Result<&MetalBuffer> {
        buffer
            .as_any()
            .downcast_ref::<MetalBuffer>()
            .ok_or_else(|| TensorError::Device("buffer was not allocated by Metal".into()))
    }

    impl CommandQueue for MetalQueue {
        fn name(&self) -> &'static str {
            "metal"
        }

        fn new_buffer(&self, len: usize) -> Result<Arc<dyn DeviceBuffer>> {
            // Metal rejects zero-length allocations.
            let buffer = self
                .device
                .newBufferWithLength_options(len.max(1), MTLResourceOptions::StorageModeShared)
                .ok_or_else(|| TensorError::Device(format!("Failed to allocate {len} bytes")))?;
            Ok(Arc::new(MetalBuffer { buffer, len }))
        }

        #[instrument(skip(self), fields(kernel = %kernel))]
        fn load_kernel(&self, kernel: &KernelName) -> Result<Arc<dyn Kernel>> {
            let unsupported = || TensorError::UnsupportedOperation(kernel.to_string());
            let source = msl::source(kernel).ok_or_else(unsupported)?;

            let library = debug_span!("CompileLibrary").in_scope(|| {
                self.device
                    .newLibraryWithSource_options_error(&NSString::from_str(&source), None)
                    .map_err(|e| TensorError::UnsupportedOperation(format!("{kernel}: {e}")))
            })?;
            let function = library
                .newFunctionWithName(&NSString::from_str(&kernel.to_string()))
                .ok_or_else(unsupported)?;
            let pipeline = debug_span!("CreatePipeline").in_scope(|| {
                self.device
                    .newComputePipelineStateWithFunction_error(&function)
                    .map_err(|e| TensorError::UnsupportedOperation(format!("{kernel}: {e}")))
            })?;

            Ok(Arc::new(MetalKernel {
                name: *kernel,
                pipeline,
            }))
        }

        fn commit(&self, command: CommandBuffer) -> Result<()> {
            let kernel = command
                .kernel()
                .as_any()
                .downcast_ref::<MetalKernel>()
                .ok_or_else(|| TensorError::Device("kernel was not compiled by Metal".into()))?;

            // Empty tensors dispatch nothing.
            if command.count() == 0 {
                return spawn_waiter(command, None);
            }
            let count = u32::try_from(command.count()).map_err(|_| {
                TensorError::Device(format!("{} elements exceed one dispatch", command.count()))
            })?;
            let fault = if msl::reports_faults(&kernel.name) {
                let fault = self
                    .device
                    .newBufferWithLength_options(4, MTLResourceOptions::StorageModeShared)
                    .ok_or_else(|| TensorError::Device("Failed to allocate fault flag".into()))?;
                unsafe { (fault.contents().as_ptr() as *mut u32).write(0) };
                Some(fault)
            } else {
                None
            };

            let command_buffer = self
                .command_queue
                .commandBuffer()
                .ok_or_else(|| TensorError::Device("Failed to create command buffer".into()))?;
            let encoder = command_buffer
                .computeCommandEncoder()
                .ok_or_else(|| TensorError::Device("Failed to create compute encoder".into()))?;

            debug_span!("EncodeKernel", label = %command.label(), count = command.count())
                .in_scope(|| {
                    encoder.setComputePipelineState(&kernel.pipeline);
                    let bindings = command
                        .inputs()
                        .iter()
                        .chain(std::iter::once(command.output()));
                    for (index, buffer) in bindings.enumerate() {
                        let buffer = downcast_buffer(buffer)?;
                        unsafe {
                            encoder.setBuffer_offset_atIndex(Some(&buffer.buffer), 0, index);
                        }
                    }
                    let count_index = msl::count_index(&kernel.name);
                    unsafe {
                        encoder.setBytes_length_atIndex(
                            NonNull::from(&count).cast::<c_void>(),
                            std::mem::size_of::<u32>(),
                            count_index,
                        );
                        if let Some(fault) = &fault {
                            encoder.setBuffer_offset_atIndex(Some(fault), 0, count_index + 1);
                        }
                    }

                    let width = kernel.pipeline.maxTotalThreadsPerThreadgroup().max(1);
                    let grid = MTLSize {
                        width: command.count(),
                        height: 1,
                        depth: 1,
                    };
                    let group = MTLSize {
                        width: width.min(grid.width),
                        height: 1,
                        depth: 1,
                    };
                    encoder.dispatchThreads_threadsPerThreadgroup(grid, group);
                    encoder.endEncoding();
                    Ok::<_, TensorError>(())
                })?;

            command_buffer.commit();
            spawn_waiter(
                command,
                Some(InFlight {
                    command_buffer,
                    fault,
                }),
            )
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Check if Metal acceleration is available at runtime
pub fn has_metal_support() -> bool {
    #[cfg(all(target_os = "macos", feature = "metal"))]
    {
        metal_queue::detect_metal()
    }
    #[cfg(not(all(target_os = "macos", feature = "metal")))]
    {
        false
    }
}

/// Build a Metal command queue, or fail if Metal is not compiled in or present
pub fn create_metal_queue() -> Result<Arc<dyn CommandQueue>> {
    #[cfg(all(target_os = "macos", feature = "metal"))]
    {
        Ok(Arc::new(metal_queue::MetalQueue::new()?))
    }
    #[cfg(not(all(target_os = "macos", feature = "metal")))]
    {
        Err(TensorError::Device("Metal backend not available".into()))
    }
}

// ============================================================================
// Tests
// ============================================================================
