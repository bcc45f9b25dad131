//! Devices and the registry that owns them

pub mod accelerator;
pub mod backend;
pub mod cpu;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{info, instrument};

use crate::config::{QueueKind, RuntimeConfig};
use crate::error::{Result, TensorError};
use accelerator::{AcceleratorBackend, CommandQueue, SoftwareQueue};
use backend::{Backend, BackendKind};
use cpu::CpuBackend;

pub const CPU: &str = "cpu";
pub const GPU: &str = "gpu";

/// A named execution target. Exactly one exists per name in a registry.
pub struct Device {
    name: String,
    kind: BackendKind,
    backend: Box<dyn Backend>,
}

impl Device {
    pub fn new(name: impl Into<String>, backend: Box<dyn Backend>) -> Self {
        Self {
            name: name.into(),
            kind: backend.kind(),
            backend,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Build the command queue the `"gpu"` device runs on.
pub fn create_queue(config: &RuntimeConfig) -> Result<Arc<dyn CommandQueue>> {
    match config.gpu_queue.resolve() {
        QueueKind::Metal => accelerator::metal::create_metal_queue(),
        _ => Ok(Arc::new(SoftwareQueue::new(config.queue_workers)?)),
    }
}

/// Lazily constructed, process-unique devices keyed by name
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<Device>>>,
    config: RuntimeConfig,
    queue: Option<Arc<dyn CommandQueue>>,
}

impl DeviceRegistry {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            config,
            queue: None,
        }
    }

    /// Registry whose `"gpu"` device runs on `queue` instead of a configured one
    pub fn with_queue(config: RuntimeConfig, queue: Arc<dyn CommandQueue>) -> Self {
        Self {
            queue: Some(queue),
            ..Self::new(config)
        }
    }

    /// Return the device for `name`, building it on first use.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Device>> {
        // Held across construction so concurrent first use builds one backend.
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(device) = devices.get(name) {
            return Ok(Arc::clone(device));
        }

        let backend: Box<dyn Backend> = match name {
            CPU => Box::new(CpuBackend::new()),
            GPU => {
                let queue = match &self.queue {
                    Some(queue) => Arc::clone(queue),
                    None => create_queue(&self.config)?,
                };
                info!(queue = queue.name(), "initialising accelerator");
                Box::new(AcceleratorBackend::new(queue))
            }
            other => return Err(TensorError::UnsupportedDevice(other.to_string())),
        };

        let device = Arc::new(Device::new(name, backend));
        devices.insert(name.to_string(), Arc::clone(&device));
        Ok(device)
    }

    /// Existing device for `name`, without constructing one
    pub fn get(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drop every device. Outstanding `Arc<Device>` clones stay valid.
    pub fn teardown(&self) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(RuntimeConfig::software().queue_workers(1))
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let devices = registry();
        let a = devices.get_or_create("cpu").unwrap();
        let b = devices.get_or_create("cpu").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.kind(), BackendKind::Cpu);
    }

    #[test]
    fn test_gpu_uses_accelerator() {
        let devices = registry();
        let gpu = devices.get_or_create("gpu").unwrap();
        assert_eq!(gpu.kind(), BackendKind::Accelerator);
        assert_eq!(gpu.name(), "gpu");
    }

    #[test]
    fn test_unknown_device() {
        let devices = registry();
        assert_eq!(
            devices.get_or_create("tpu").unwrap_err(),
            TensorError::UnsupportedDevice("tpu".into())
        );
        assert!(devices.get("tpu").is_none());
    }

    #[test]
    fn test_concurrent_first_use_builds_one_device() {
        let devices = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let devices = Arc::clone(&devices);
                thread::spawn(move || devices.get_or_create("gpu").unwrap())
            })
            .collect();
        let built: Vec<Arc<Device>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(built.iter().all(|d| Arc::ptr_eq(d, &built[0])));
        assert_eq!(devices.names(), vec!["gpu".to_string()]);
    }

    #[test]
    fn test_teardown_clears() {
        let devices = registry();
        devices.get_or_create("cpu").unwrap();
        devices.get_or_create("gpu").unwrap();
        assert_eq!(devices.names(), vec!["cpu".to_string(), "gpu".to_string()]);
        devices.teardown();
        assert!(devices.names().is_empty());
    }
}
