//! In-memory hypervisor used by tests and the noop pod flows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use vpod_shared::config::{HypervisorConfig, PodConfig};
use vpod_shared::{Error, Result};

use crate::{Capabilities, DeviceData, Hypervisor};

/// Records every call so tests can assert on ordering and content.
#[derive(Debug, Default)]
pub struct MockHypervisor {
    pub config: HypervisorConfig,
    pub pod_id: String,
    pub devices: Vec<DeviceData>,
    pub running: bool,
    pub paused: bool,
    pub netns: Option<PathBuf>,
    vm_dir: PathBuf,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn init(&mut self, config: &HypervisorConfig) -> Result<()> {
        let mut config = config.clone();
        config.validate()?;
        self.config = config;
        Ok(())
    }

    async fn create_pod(&mut self, config: &PodConfig) -> Result<()> {
        self.pod_id = config.id.clone();
        self.vm_dir = config.storage_roots.run_root.join(&config.id).join("vm");
        Ok(())
    }

    async fn add_device(&mut self, device: DeviceData) -> Result<()> {
        self.devices.push(device);
        Ok(())
    }

    async fn remove_device(&mut self, device: DeviceData) -> Result<()> {
        self.devices.retain(|d| *d != device);
        Ok(())
    }

    async fn start_pod(&mut self, netns: Option<&Path>) -> Result<()> {
        if self.running {
            return Err(Error::HypervisorFailure("already running".into()));
        }
        self.netns = netns.map(Path::to_path_buf);
        self.running = true;
        Ok(())
    }

    async fn wait_pod(&mut self, _timeout: Duration) -> Result<()> {
        if self.running {
            Ok(())
        } else {
            Err(Error::Timeout("waiting for VM".into()))
        }
    }

    async fn stop_pod(&mut self) -> Result<()> {
        self.running = false;
        self.paused = false;
        Ok(())
    }

    async fn pause_pod(&mut self) -> Result<()> {
        // The orchestrator's state machine gates legality; a mock
        // rebuilt from persisted state has no VM state of its own.
        self.paused = true;
        Ok(())
    }

    async fn resume_pod(&mut self) -> Result<()> {
        self.paused = false;
        Ok(())
    }

    fn console_path(&self) -> PathBuf {
        self.vm_dir.join("console.sock")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_device_hotplug: true,
            multi_queue: false,
        }
    }
}
