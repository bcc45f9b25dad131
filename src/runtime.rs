//! Process-wide service holding the device and tensor registries

use std::sync::{Arc, OnceLock};

use tracing::{debug, debug_span};

use crate::config::RuntimeConfig;
use crate::device::accelerator::CommandQueue;
use crate::device::{Device, DeviceRegistry};
use crate::error::Result;
use crate::tensor::registry::TensorRegistry;

static GLOBAL: OnceLock<Arc<Runtime>> = OnceLock::new();

pub struct Runtime {
    devices: DeviceRegistry,
    tensors: TensorRegistry,
    config: RuntimeConfig,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            devices: DeviceRegistry::new(config.clone()),
            tensors: TensorRegistry::new(),
            config,
        })
    }

    /// Runtime whose `"gpu"` device executes on `queue`
    pub fn with_queue(config: RuntimeConfig, queue: Arc<dyn CommandQueue>) -> Arc<Self> {
        Arc::new(Self {
            devices: DeviceRegistry::with_queue(config.clone(), queue),
            tensors: TensorRegistry::new(),
            config,
        })
    }

    /// Shared runtime, initialised from the environment on first use
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| {
            debug_span!("InitRuntime").in_scope(|| Runtime::new(RuntimeConfig::default()))
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceRegistry {
        &self.devices
    }

    pub fn tensors(&self) -> &TensorRegistry {
        &self.tensors
    }

    pub fn device(&self, name: &str) -> Result<Arc<Device>> {
        self.devices.get_or_create(name)
    }

    /// Erase every tensor, then drop every device.
    pub fn teardown(&self) {
        debug!(
            tensors = self.tensors.len(),
            devices = ?self.devices.names(),
            "tearing down runtime"
        );
        self.tensors.clear();
        self.devices.teardown();
    }
}
