//! Hypervisor adapters.
//!
//! The orchestration engine never composes hypervisor command lines;
//! it describes devices with [`DeviceData`] and drives the VM through
//! the [`Hypervisor`] trait. Adapters own the process and control
//! channel details.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vpod_shared::Result;
use vpod_shared::config::PodConfig;
use vpod_shared::volumes::{Socket, Volume};

pub mod capabilities;
pub mod ch;
pub mod mock;
pub mod params;

pub use capabilities::Capabilities;
pub use ch::CloudHypervisor;
pub use mock::MockHypervisor;

/// Default VM-ready wait budget.
pub const WAIT_POD_TIMEOUT: Duration = Duration::from_secs(10);

/// A network device handed to the VM: one host tap bridged to the
/// pod's veth, mirrored by a guest interface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetDevice {
    pub tap_name: String,
    pub mac_addr: String,
}

/// A block drive, hotpluggable when the adapter advertises support.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Drive {
    pub path: PathBuf,
    /// Block slot; determines the guest device name (`vda` + index).
    pub index: u32,
    #[serde(default)]
    pub readonly: bool,
}

impl Drive {
    /// Guest device name for this drive's slot (`vda`, `vdb`, …).
    pub fn virt_path(&self) -> PathBuf {
        let mut name = String::from("vd");
        let mut index = self.index as i64;
        loop {
            name.insert(2, (b'a' + (index % 26) as u8) as char);
            index = index / 26 - 1;
            if index < 0 {
                break;
            }
        }
        PathBuf::from("/dev").join(name)
    }
}

/// Typed device descriptions, one variant per device kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DeviceData {
    /// VM boot image.
    Image { path: PathBuf },
    /// Shared filesystem volume (9p mount tag + host path).
    Fs(Volume),
    /// Guest network interface backed by a host tap.
    Net(NetDevice),
    /// Serial console socket.
    Serial { path: PathBuf },
    /// Block drive.
    Block(Drive),
    /// Guest console device.
    Console { path: PathBuf },
    /// Agent channel serial port.
    SerialPort(Socket),
    /// VFIO passthrough device, identified by its BDF.
    Vfio { bdf: String },
}

/// Contract every hypervisor adapter implements.
///
/// `start_pod` must be executed inside the pod's network namespace;
/// adapters enter it on the child process, not the calling thread.
#[async_trait]
pub trait Hypervisor: Send {
    async fn init(&mut self, config: &vpod_shared::config::HypervisorConfig) -> Result<()>;

    /// Stage the VM definition for the pod. No process is started.
    async fn create_pod(&mut self, config: &PodConfig) -> Result<()>;

    /// Append or hotplug a device, depending on VM state.
    async fn add_device(&mut self, device: DeviceData) -> Result<()>;

    /// Remove a previously added device.
    async fn remove_device(&mut self, device: DeviceData) -> Result<()>;

    async fn start_pod(&mut self, netns: Option<&Path>) -> Result<()>;

    /// Block until the VM answers on its control channel.
    async fn wait_pod(&mut self, timeout: Duration) -> Result<()>;

    async fn stop_pod(&mut self) -> Result<()>;

    async fn pause_pod(&mut self) -> Result<()>;

    async fn resume_pod(&mut self) -> Result<()>;

    /// Path of the pod console device.
    fn console_path(&self) -> PathBuf;

    fn capabilities(&self) -> Capabilities;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drive_virt_path() {
        let drive = |index| Drive {
            path: PathBuf::from("/dev/sda"),
            index,
            readonly: false,
        };
        assert_eq!(drive(0).virt_path(), PathBuf::from("/dev/vda"));
        assert_eq!(drive(1).virt_path(), PathBuf::from("/dev/vdb"));
        assert_eq!(drive(25).virt_path(), PathBuf::from("/dev/vdz"));
        assert_eq!(drive(26).virt_path(), PathBuf::from("/dev/vdaa"));
        assert_eq!(drive(27).virt_path(), PathBuf::from("/dev/vdab"));
    }

    #[test]
    fn test_device_data_kind_tags() {
        let device = DeviceData::Vfio { bdf: "02:10.0".into() };
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains(r#""kind":"vfio""#));
    }
}
