//! Runtime configuration
//!
//! Selects which command queue backs the `"gpu"` device and how many worker
//! threads the software queue runs. The defaults can be overridden through
//! environment variables for easy experimentation:
//!
//! * `TENSORLIB_GPU_QUEUE` - `auto` (default), `metal` or `software`
//! * `TENSORLIB_QUEUE_WORKERS` - software queue worker threads (default 2)

use std::str::FromStr;

use thiserror::Error;

use crate::device::accelerator::metal;

/// Command queue implementations for the accelerator backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Metal when available, otherwise the software queue
    Auto,
    /// Apple Metal compute (macOS only)
    Metal,
    /// Threaded host queue (always available)
    Software,
}

impl QueueKind {
    /// Check if this queue can be constructed on the current platform
    pub fn is_available(&self) -> bool {
        match self {
            QueueKind::Metal => metal::has_metal_support(),
            QueueKind::Software | QueueKind::Auto => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::Auto => "Auto",
            QueueKind::Metal => "Metal (GPU)",
            QueueKind::Software => "Software",
        }
    }

    /// Resolve `Auto` to a concrete queue
    pub fn resolve(&self) -> QueueKind {
        match self {
            QueueKind::Auto if metal::has_metal_support() => QueueKind::Metal,
            QueueKind::Auto => QueueKind::Software,
            other => *other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid queue name: {0}")]
pub struct ParseQueueKindError(String);

impl FromStr for QueueKind {
    type Err = ParseQueueKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(QueueKind::Auto),
            "metal" => Ok(QueueKind::Metal),
            "software" | "sw" | "host" => Ok(QueueKind::Software),
            _ => Err(ParseQueueKindError(s.to_string())),
        }
    }
}

/// Configuration shared by every device a runtime creates
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Queue backing the `"gpu"` device
    pub gpu_queue: QueueKind,
    /// Worker threads for the software queue
    pub queue_workers: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let gpu_queue = std::env::var("TENSORLIB_GPU_QUEUE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(QueueKind::Auto);

        let queue_workers = std::env::var("TENSORLIB_QUEUE_WORKERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(2)
            .max(1);

        Self {
            gpu_queue,
            queue_workers,
        }
    }
}

impl RuntimeConfig {
    pub fn with_gpu_queue(gpu_queue: QueueKind) -> Self {
        Self {
            gpu_queue,
            ..Default::default()
        }
    }

    /// Always use the software queue, regardless of platform
    pub fn software() -> Self {
        Self::with_gpu_queue(QueueKind::Software)
    }

    pub fn queue_workers(mut self, workers: usize) -> Self {
        self.queue_workers = workers.max(1);
        self
    }
}

/// Queues that can back the `"gpu"` device on this platform
pub fn available_queues() -> Vec<QueueKind> {
    let mut queues = vec![QueueKind::Software];
    if QueueKind::Metal.is_available() {
        queues.push(QueueKind::Metal);
    }
    queues
}

/// Print information about available devices and queues
pub fn print_device_info() {
    println!("Devices: cpu, gpu");
    println!("Available gpu queues:");
    for queue in available_queues() {
        println!("  ✓ {}", queue.name());
    }

    println!("\nTo select a specific queue, set TENSORLIB_GPU_QUEUE:");
    println!("  export TENSORLIB_GPU_QUEUE=software # Threaded host queue");
    println!("  export TENSORLIB_GPU_QUEUE=metal    # Force Metal (GPU)");
    println!("  export TENSORLIB_GPU_QUEUE=auto     # Automatic selection (default)");
}
