//! Invocation tracking and dispatch for the accelerator
//!
//! Every result id maps to a durable [`Invocation`] describing how to produce
//! it. Command buffers are built from that record at dispatch time and thrown
//! away after they complete; a requeue simply builds another one.
//!
//! Invocations move `Idle -> Busy -> Done | Error`. A Busy invocation without
//! a handle is waiting on its operands and is submitted by [`dispatch_ready`]
//! once they are all Done, so callers of `schedule` never block.
//!
//! [`dispatch_ready`]: Scheduler::dispatch_ready

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, instrument, trace, warn};

use super::queue::{
    CommandBuffer, CommandBufferId, CommandQueue, Completion, DeviceBuffer, Kernel,
};
use crate::device::backend::{BackendStats, CommandStatus};
use crate::error::{Result, TensorError};
use crate::tensor::TensorId;

/// Resubmissions allowed after a failed execution
pub const MAX_REQUEUES: u32 = 1;

struct Invocation {
    operands: Vec<TensorId>,
    kernel: Arc<dyn Kernel>,
    /// Output size in bytes
    len: usize,
    handle: Option<CommandBufferId>,
    status: CommandStatus,
    /// Submissions so far, including the first
    attempts: u32,
    error: Option<String>,
}

#[derive(Default)]
struct SchedulerState {
    buffers: HashMap<TensorId, Arc<dyn DeviceBuffer>>,
    invocations: HashMap<TensorId, Invocation>,
    to_requeue: Vec<TensorId>,
    stats: BackendStats,
    log: Vec<TensorId>,
}

enum Readiness {
    Ready,
    Pending,
    Failed(String),
}

impl SchedulerState {
    fn readiness(&self, id: TensorId) -> Readiness {
        match self.invocations.get(&id) {
            Some(inv) => match inv.status {
                CommandStatus::Done => Readiness::Ready,
                CommandStatus::Error if !self.to_requeue.contains(&id) => Readiness::Failed(
                    format!("operand {id} failed: {}", inv.error.as_deref().unwrap_or("")),
                ),
                _ => Readiness::Pending,
            },
            None if self.buffers.contains_key(&id) => Readiness::Ready,
            None => Readiness::Failed(format!("operand {id} was released")),
        }
    }

    /// Size in bytes `id` has, or will have once produced
    fn tracked_len(&self, id: TensorId) -> Option<usize> {
        self.invocations
            .get(&id)
            .map(|inv| inv.len)
            .or_else(|| self.buffers.get(&id).map(|buffer| buffer.len()))
    }

    /// Mark `id` and every Idle invocation it transitively depends on Busy.
    fn mark_busy(&mut self, id: TensorId) {
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(inv) = self.invocations.get_mut(&next) {
                if inv.status == CommandStatus::Idle {
                    inv.status = CommandStatus::Busy;
                    inv.handle = None;
                    stack.extend(inv.operands.iter().copied());
                }
            }
        }
    }

    fn fail(&mut self, id: TensorId, message: String) {
        if let Some(inv) = self.invocations.get_mut(&id) {
            warn!(tensor = %id, %message, "invocation failed permanently");
            inv.status = CommandStatus::Error;
            inv.handle = None;
            inv.error = Some(message);
        }
    }
}

/// Tracks invocations and device buffers for one accelerator backend
pub struct Scheduler {
    queue: Arc<dyn CommandQueue>,
    state: Mutex<SchedulerState>,
    changed: Condvar,
    next_handle: AtomicU64,
    this: Weak<Scheduler>,
}

impl Scheduler {
    pub fn new(queue: Arc<dyn CommandQueue>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            queue,
            state: Mutex::new(SchedulerState::default()),
            changed: Condvar::new(),
            next_handle: AtomicU64::new(1),
            this: this.clone(),
        })
    }

    pub fn queue(&self) -> &Arc<dyn CommandQueue> {
        &self.queue
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the storage for `id` with `bytes` and forget how it was produced.
    pub fn assign(&self, id: TensorId, bytes: &[u8]) -> Result<()> {
        // A fresh buffer keeps in-flight readers of the old one consistent.
        let buffer = self.queue.new_buffer(bytes.len())?;
        buffer.write(bytes)?;

        let mut state = self.lock();
        state.invocations.remove(&id);
        state.to_requeue.retain(|queued| *queued != id);
        state.buffers.insert(id, buffer);
        self.changed.notify_all();
        Ok(())
    }

    /// Record an Idle invocation producing `result`.
    pub fn enqueue(
        &self,
        operands: &[TensorId],
        result: TensorId,
        kernel: Arc<dyn Kernel>,
    ) -> Result<()> {
        let name = kernel.name();
        if operands.len() != name.op.arity() {
            return Err(TensorError::UnsupportedOperation(format!(
                "{name} expects {} operands, got {}",
                name.op.arity(),
                operands.len()
            )));
        }

        let mut state = self.lock();
        let lens = operands
            .iter()
            .map(|id| state.tracked_len(*id).ok_or(TensorError::UnknownTensor(*id)))
            .collect::<Result<Vec<usize>>>()?;
        let len = lens[0];
        if let Some(bad) = lens.iter().find(|l| **l != len) {
            return Err(TensorError::BufferLength {
                expected: len,
                got: *bad,
            });
        }
        if len % name.dtype.bytes != 0 {
            return Err(TensorError::BufferLength {
                expected: len - len % name.dtype.bytes,
                got: len,
            });
        }

        state.to_requeue.retain(|queued| *queued != result);
        state.invocations.insert(
            result,
            Invocation {
                operands: operands.to_vec(),
                kernel,
                len,
                handle: None,
                status: CommandStatus::Idle,
                attempts: 0,
                error: None,
            },
        );
        debug!(tensor = %result, kernel = %name, "recorded invocation");
        Ok(())
    }

    /// Promote the invocation for `id` (and its pending operands) to Busy.
    #[instrument(skip(self))]
    pub fn schedule(&self, id: TensorId) {
        let mut state = self.lock();
        self.schedule_locked(&mut state, id);
    }

    fn schedule_locked(&self, state: &mut SchedulerState, id: TensorId) {
        match state.invocations.get(&id).map(|inv| inv.status) {
            Some(CommandStatus::Idle) => {
                state.mark_busy(id);
                self.dispatch_ready(state);
            }
            Some(status) => trace!(tensor = %id, ?status, "already scheduled"),
            None => {}
        }
    }

    /// Submit every waiting invocation whose operands are Done, and fail the
    /// ones whose operands can never become Done.
    fn dispatch_ready(&self, state: &mut SchedulerState) {
        loop {
            let mut ready = Vec::new();
            let mut doomed = Vec::new();
            for (id, inv) in &state.invocations {
                if inv.status != CommandStatus::Busy || inv.handle.is_some() {
                    continue;
                }
                let mut pending = false;
                let mut failure = None;
                for operand in &inv.operands {
                    match state.readiness(*operand) {
                        Readiness::Ready => {}
                        Readiness::Pending => pending = true,
                        Readiness::Failed(message) => {
                            failure = Some(message);
                            break;
                        }
                    }
                }
                match failure {
                    Some(message) => doomed.push((*id, message)),
                    None if !pending => ready.push(*id),
                    None => {}
                }
            }

            if ready.is_empty() && doomed.is_empty() {
                break;
            }
            let mut failed_any = !doomed.is_empty();
            for (id, message) in doomed {
                state.fail(id, message);
            }
            for id in ready {
                if let Err(e) = self.submit(state, id) {
                    state.fail(id, e.to_string());
                    failed_any = true;
                }
            }
            if !failed_any {
                // Submissions never complete while the lock is held, so
                // nothing else can have become ready.
                break;
            }
        }
        self.changed.notify_all();
    }

    /// Build a fresh command buffer from the invocation record and commit it.
    fn submit(&self, state: &mut SchedulerState, id: TensorId) -> Result<()> {
        let (kernel, operands, len) = match state.invocations.get(&id) {
            Some(inv) => (Arc::clone(&inv.kernel), inv.operands.clone(), inv.len),
            None => return Err(TensorError::UnknownTensor(id)),
        };
        let inputs = operands
            .iter()
            .map(|operand| {
                state
                    .buffers
                    .get(operand)
                    .cloned()
                    .ok_or(TensorError::UnknownTensor(*operand))
            })
            .collect::<Result<Vec<_>>>()?;
        let output = self.queue.new_buffer(len)?;
        let count = len / kernel.name().dtype.bytes;

        let handle = CommandBufferId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let this = self.this.clone();
        let command = CommandBuffer::new(
            handle,
            id,
            kernel,
            inputs,
            Arc::clone(&output),
            count,
            Box::new(move |handle, completion| {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.on_complete(id, handle, completion);
                }
            }),
        );

        state.buffers.insert(id, output);
        if let Some(inv) = state.invocations.get_mut(&id) {
            inv.handle = Some(handle);
            inv.attempts += 1;
            debug!(tensor = %id, %handle, attempt = inv.attempts, "submitting");
        }
        state.stats.submissions += 1;
        state.log.push(id);
        self.queue.commit(command)
    }

    /// Device notification for a finished command buffer
    fn on_complete(&self, id: TensorId, handle: CommandBufferId, completion: Completion) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(inv) = state.invocations.get_mut(&id) else {
            trace!(tensor = %id, %handle, "completion for released invocation");
            return;
        };
        if inv.handle != Some(handle) {
            trace!(tensor = %id, %handle, "ignoring stale completion");
            return;
        }
        inv.handle = None;

        match completion {
            Completion::Completed => {
                inv.status = CommandStatus::Done;
                state.stats.completions += 1;
                debug!(tensor = %id, %handle, "completed");
            }
            Completion::Failed(message) => {
                inv.status = CommandStatus::Error;
                inv.error = Some(message.clone());
                let retry = inv.attempts <= MAX_REQUEUES;
                state.stats.failures += 1;
                if retry {
                    warn!(tensor = %id, %handle, %message, "execution failed, requeue pending");
                    state.to_requeue.push(id);
                } else {
                    warn!(tensor = %id, %handle, %message, "execution failed permanently");
                }
            }
        }
        self.dispatch_ready(state);
    }

    /// Resubmit every invocation waiting on the requeue list.
    pub fn requeue(&self) {
        let mut state = self.lock();
        self.requeue_locked(&mut state);
    }

    fn requeue_locked(&self, state: &mut SchedulerState) {
        let queued = std::mem::take(&mut state.to_requeue);
        for id in queued {
            let Some(inv) = state.invocations.get_mut(&id) else {
                continue;
            };
            if inv.status != CommandStatus::Error {
                continue;
            }
            // The old handle was consumed by its commit.
            inv.handle = None;
            inv.error = None;
            inv.status = CommandStatus::Busy;
            let operands = inv.operands.clone();
            state.stats.requeues += 1;
            warn!(tensor = %id, "requeueing invocation");
            for operand in operands {
                state.mark_busy(operand);
            }
        }
        self.dispatch_ready(state);
    }

    /// Block until the invocation for `id` is terminal.
    #[instrument(skip(self))]
    pub fn wait_for(&self, id: TensorId) -> Result<()> {
        let mut state = self.lock();
        loop {
            if !state.to_requeue.is_empty() {
                self.requeue_locked(&mut state);
                continue;
            }
            match state.invocations.get(&id).map(|inv| inv.status) {
                None if state.buffers.contains_key(&id) => return Ok(()),
                None => return Err(TensorError::UnknownTensor(id)),
                Some(CommandStatus::Done) => return Ok(()),
                Some(CommandStatus::Error) => {
                    let message = state
                        .invocations
                        .get(&id)
                        .and_then(|inv| inv.error.clone())
                        .unwrap_or_default();
                    return Err(TensorError::execution(id, message));
                }
                Some(CommandStatus::Idle) => {
                    self.schedule_locked(&mut state, id);
                    continue;
                }
                Some(CommandStatus::Busy) => {}
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn copy_to_host(&self, id: TensorId, out: &mut [u8]) -> Result<()> {
        self.wait_for(id)?;
        let buffer = self
            .lock()
            .buffers
            .get(&id)
            .cloned()
            .ok_or(TensorError::UnknownTensor(id))?;
        buffer.read(out)
    }

    pub fn status(&self, id: TensorId) -> CommandStatus {
        self.lock()
            .invocations
            .get(&id)
            .map_or(CommandStatus::Idle, |inv| inv.status)
    }

    pub fn release(&self, id: TensorId) {
        let mut state = self.lock();
        state.buffers.remove(&id);
        state.invocations.remove(&id);
        state.to_requeue.retain(|queued| *queued != id);
        self.dispatch_ready(&mut state);
    }

    pub fn has_buffer(&self, id: TensorId) -> bool {
        self.lock().buffers.contains_key(&id)
    }

    pub fn has_invocation(&self, id: TensorId) -> bool {
        self.lock().invocations.contains_key(&id)
    }

    pub fn stats(&self) -> BackendStats {
        self.lock().stats
    }

    pub fn submission_log(&self) -> Vec<TensorId> {
        self.lock().log.clone()
    }
}
