//! Synchronous host backend
//!
//! Kernels run inside `enqueue_kernel`, so every invocation is terminal as
//! soon as it is recorded. This backend is the reference the accelerator is
//! checked against.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, instrument};

use super::backend::{Backend, BackendKind, BackendStats, CommandStatus};
use crate::error::{Result, TensorError};
use crate::tensor::kernels::{self, ElementwiseParams, KernelName};
use crate::tensor::TensorId;

struct CpuInvocation {
    status: CommandStatus,
    error: Option<String>,
}

#[derive(Default)]
struct CpuState {
    buffers: HashMap<TensorId, Vec<u8>>,
    invocations: HashMap<TensorId, CpuInvocation>,
    stats: BackendStats,
    log: Vec<TensorId>,
}

#[derive(Default)]
pub struct CpuBackend {
    state: Mutex<CpuState>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CpuState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn assign(&self, id: TensorId, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.invocations.remove(&id);
        let buffer = state.buffers.entry(id).or_default();
        buffer.clear();
        buffer.extend_from_slice(bytes);
        Ok(())
    }

    fn copy_to_host(&self, id: TensorId, out: &mut [u8]) -> Result<()> {
        self.wait_for(id)?;
        let state = self.lock();
        let buffer = state
            .buffers
            .get(&id)
            .ok_or(TensorError::UnknownTensor(id))?;
        if buffer.len() != out.len() {
            return Err(TensorError::BufferLength {
                expected: buffer.len(),
                got: out.len(),
            });
        }
        out.copy_from_slice(buffer);
        Ok(())
    }

    #[instrument(skip(self, operands))]
    fn enqueue_kernel(&self, operands: &[TensorId], result: TensorId, op: &str) -> Result<()> {
        let kernel: KernelName = op.parse()?;
        if operands.len() != kernel.op.arity() {
            return Err(TensorError::UnsupportedOperation(format!(
                "{kernel} expects {} operands, got {}",
                kernel.op.arity(),
                operands.len()
            )));
        }

        let mut state = self.lock();
        let inputs = operands
            .iter()
            .map(|id| {
                state
                    .buffers
                    .get(id)
                    .map(Vec::as_slice)
                    .ok_or(TensorError::UnknownTensor(*id))
            })
            .collect::<Result<Vec<&[u8]>>>()?;

        let len = inputs[0].len();
        if let Some(bad) = inputs.iter().find(|i| i.len() != len) {
            return Err(TensorError::BufferLength {
                expected: len,
                got: bad.len(),
            });
        }
        if len % kernel.dtype.bytes != 0 {
            return Err(TensorError::BufferLength {
                expected: len - len % kernel.dtype.bytes,
                got: len,
            });
        }

        let outcome = kernels::execute(ElementwiseParams {
            kernel,
            inputs: &inputs,
            count: len / kernel.dtype.bytes,
        });

        state.stats.submissions += 1;
        state.log.push(result);
        let invocation = match outcome {
            Ok(bytes) => {
                state.stats.completions += 1;
                state.buffers.insert(result, bytes);
                CpuInvocation {
                    status: CommandStatus::Done,
                    error: None,
                }
            }
            Err(e) => {
                debug!(error = %e, "host kernel failed");
                state.stats.failures += 1;
                state.buffers.remove(&result);
                CpuInvocation {
                    status: CommandStatus::Error,
                    error: Some(e.to_string()),
                }
            }
        };
        state.invocations.insert(result, invocation);
        Ok(())
    }

    fn schedule_realize(&self, _id: TensorId) -> Result<()> {
        Ok(())
    }

    fn wait_for(&self, id: TensorId) -> Result<()> {
        let state = self.lock();
        match state.invocations.get(&id) {
            Some(CpuInvocation {
                status: CommandStatus::Error,
                error,
            }) => Err(TensorError::execution(
                id,
                error.clone().unwrap_or_default(),
            )),
            Some(_) => Ok(()),
            None if state.buffers.contains_key(&id) => Ok(()),
            None => Err(TensorError::UnknownTensor(id)),
        }
    }

    fn get_cmdbuf_status(&self, id: TensorId) -> CommandStatus {
        self.lock()
            .invocations
            .get(&id)
            .map_or(CommandStatus::Idle, |inv| inv.status)
    }

    fn release(&self, id: TensorId) {
        let mut state = self.lock();
        state.buffers.remove(&id);
        state.invocations.remove(&id);
    }

    fn has_buffer(&self, id: TensorId) -> bool {
        self.lock().buffers.contains_key(&id)
    }

    fn has_invocation(&self, id: TensorId) -> bool {
        self.lock().invocations.contains_key(&id)
    }

    fn stats(&self) -> BackendStats {
        self.lock().stats
    }

    fn submission_log(&self) -> Vec<TensorId> {
        self.lock().log.clone()
    }
}
