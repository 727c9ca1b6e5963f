//! cloud-hypervisor adapter.
//!
//! Drives a cloud-hypervisor process through its REST API on a unix
//! socket. Devices staged before boot become part of the initial VM
//! definition; devices added afterwards are hotplugged.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::{Method, Request};
use serde_json::json;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use vpod_shared::config::{HypervisorConfig, PodConfig, Resources};
use vpod_shared::{Error, Result};

use crate::params::kernel_cmdline;
use crate::{Capabilities, DeviceData, Hypervisor};

const CLOUD_HYPERVISOR_BIN: &str = "/usr/bin/cloud-hypervisor";
const API_SOCKET_RETRY: Duration = Duration::from_millis(100);
const API_SOCKET_WAIT: Duration = Duration::from_secs(5);
const SHUTDOWN_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmmState {
    NotCreated,
    Created,
    Running,
    Paused,
}

pub struct CloudHypervisor {
    config: HypervisorConfig,
    pod_id: String,
    vm_dir: PathBuf,
    resources: Resources,
    /// Devices staged into the boot-time VM definition.
    devices: Vec<DeviceData>,
    child: Option<Child>,
    state: VmmState,
}

impl Default for CloudHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudHypervisor {
    pub fn new() -> Self {
        Self {
            config: HypervisorConfig::default(),
            pod_id: String::new(),
            vm_dir: PathBuf::new(),
            resources: Resources::default(),
            devices: Vec::new(),
            child: None,
            state: VmmState::NotCreated,
        }
    }

    fn binary(&self) -> PathBuf {
        if self.config.hypervisor_path.as_os_str().is_empty() {
            PathBuf::from(CLOUD_HYPERVISOR_BIN)
        } else {
            self.config.hypervisor_path.clone()
        }
    }

    fn api_socket(&self) -> PathBuf {
        self.vm_dir.join("api.sock")
    }

    /// Whether a VMM is answering for this pod. Adapters rebuilt from
    /// persisted state have no in-memory lifecycle, so the API socket
    /// is the source of truth.
    fn vmm_live(&self) -> bool {
        matches!(self.state, VmmState::Running | VmmState::Paused)
            || self.api_socket().exists()
    }

    async fn api_request(
        &self,
        endpoint: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes> {
        use http_body_util::{BodyExt, Full};
        use hyper_util::client::legacy::Client;
        use hyper_util::rt::TokioExecutor;

        let connector = hyperlocal::UnixConnector;
        let client: Client<_, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build(connector);

        let uri = hyperlocal::Uri::new(self.api_socket(), &format!("/api/v1/{endpoint}"));
        let method = if endpoint == "vm.info" {
            Method::GET
        } else {
            Method::PUT
        };
        let payload = match body {
            Some(value) => Bytes::from(serde_json::to_vec(&value)?),
            None => Bytes::new(),
        };

        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| Error::HypervisorFailure(e.to_string()))?;

        let resp = client
            .request(req)
            .await
            .map_err(|e| Error::HypervisorFailure(format!("{endpoint}: {e}")))?;

        let status = resp.status();
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::HypervisorFailure(e.to_string()))?
            .to_bytes();

        if !status.is_success() {
            return Err(Error::HypervisorFailure(format!(
                "{endpoint} returned {status}: {}",
                String::from_utf8_lossy(&bytes)
            )));
        }
        Ok(bytes)
    }

    /// Build the boot-time VM definition from the staged devices.
    fn vm_config_json(&self) -> serde_json::Value {
        let mut disks = Vec::new();
        let mut net = Vec::new();
        let mut fs = Vec::new();
        let mut serial = json!({ "mode": "Off" });
        let mut console = json!({ "mode": "Off" });
        let mut serial_ports = Vec::new();
        let mut vfio = Vec::new();

        for device in &self.devices {
            match device {
                DeviceData::Image { path } => disks.insert(
                    0,
                    json!({ "path": path, "readonly": true }),
                ),
                DeviceData::Block(drive) => disks.push(json!({
                    "path": &drive.path,
                    "readonly": drive.readonly,
                })),
                DeviceData::Net(nic) => net.push(json!({
                    "tap": &nic.tap_name,
                    "mac": &nic.mac_addr,
                })),
                DeviceData::Fs(volume) => fs.push(json!({
                    "tag": &volume.mount_tag,
                    "socket": &volume.host_path,
                })),
                DeviceData::Serial { path } => {
                    serial = json!({ "mode": "Socket", "socket": path });
                }
                DeviceData::Console { path } => {
                    console = json!({ "mode": "Socket", "socket": path });
                }
                DeviceData::SerialPort(socket) => serial_ports.push(json!({
                    "id": &socket.id,
                    "socket": &socket.host_path,
                })),
                DeviceData::Vfio { bdf } => vfio.push(json!({
                    "path": format!("/sys/bus/pci/devices/0000:{bdf}"),
                })),
            }
        }

        let shared_memory = !fs.is_empty();
        json!({
            "cpus": {
                "boot_vcpus": self.resources.vcpus,
                "max_vcpus": self.resources.vcpus,
            },
            "memory": {
                "size": (self.resources.mem_mib as u64) * 1024 * 1024,
                "shared": shared_memory,
            },
            "payload": {
                "kernel": &self.config.kernel_path,
                "cmdline": kernel_cmdline(&self.config),
            },
            "disks": disks,
            "net": net,
            "fs": fs,
            "serial": serial,
            "console": console,
            "serial_ports": serial_ports,
            "devices": vfio,
        })
    }

    async fn hotplug(&self, device: &DeviceData) -> Result<()> {
        match device {
            DeviceData::Block(drive) => {
                self.api_request(
                    "vm.add-disk",
                    Some(json!({ "path": &drive.path, "readonly": drive.readonly })),
                )
                .await?;
            }
            DeviceData::Net(nic) => {
                self.api_request(
                    "vm.add-net",
                    Some(json!({ "tap": &nic.tap_name, "mac": &nic.mac_addr })),
                )
                .await?;
            }
            DeviceData::Vfio { bdf } => {
                self.api_request(
                    "vm.add-device",
                    Some(json!({ "path": format!("/sys/bus/pci/devices/0000:{bdf}") })),
                )
                .await?;
            }
            DeviceData::Fs(volume) => {
                self.api_request(
                    "vm.add-fs",
                    Some(json!({
                        "tag": &volume.mount_tag,
                        "socket": &volume.host_path,
                    })),
                )
                .await?;
            }
            other => {
                return Err(Error::HypervisorFailure(format!(
                    "device {other:?} cannot be hotplugged"
                )));
            }
        }
        Ok(())
    }

    async fn wait_api_socket(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + API_SOCKET_WAIT;
        while !self.api_socket().exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("hypervisor API socket".into()));
            }
            tokio::time::sleep(API_SOCKET_RETRY).await;
        }
        Ok(())
    }

    async fn kill_vmm(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!(pod_id = %self.pod_id, "Killing hypervisor process");
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Hypervisor for CloudHypervisor {
    async fn init(&mut self, config: &HypervisorConfig) -> Result<()> {
        let mut config = config.clone();
        config.validate()?;
        self.config = config;
        Ok(())
    }

    async fn create_pod(&mut self, config: &PodConfig) -> Result<()> {
        self.pod_id = config.id.clone();
        self.vm_dir = config
            .storage_roots
            .run_root
            .join(&config.id)
            .join("vm");
        self.resources = config.resources;
        self.devices = vec![DeviceData::Image {
            path: self.config.image_path.clone(),
        }];
        self.state = VmmState::Created;
        Ok(())
    }

    async fn add_device(&mut self, device: DeviceData) -> Result<()> {
        if self.vmm_live() {
            debug!(pod_id = %self.pod_id, device = ?device, "Hotplugging device");
            self.hotplug(&device).await?;
        } else {
            debug!(pod_id = %self.pod_id, device = ?device, "Staging device");
        }
        self.devices.push(device);
        Ok(())
    }

    async fn remove_device(&mut self, device: DeviceData) -> Result<()> {
        if self.vmm_live() {
            let id = match &device {
                DeviceData::Block(drive) => drive.virt_path().display().to_string(),
                DeviceData::Vfio { bdf } => bdf.clone(),
                DeviceData::Net(nic) => nic.tap_name.clone(),
                other => {
                    return Err(Error::HypervisorFailure(format!(
                        "device {other:?} cannot be removed at runtime"
                    )));
                }
            };
            self.api_request("vm.remove-device", Some(json!({ "id": id })))
                .await?;
        }
        self.devices.retain(|d| *d != device);
        Ok(())
    }

    async fn start_pod(&mut self, netns: Option<&Path>) -> Result<()> {
        if self.state != VmmState::Created {
            return Err(Error::HypervisorFailure(
                "VM has not been created".into(),
            ));
        }

        tokio::fs::create_dir_all(&self.vm_dir).await?;

        let api_socket = self.api_socket();
        if api_socket.exists() {
            debug!(path = %api_socket.display(), "Removing stale API socket");
            let _ = tokio::fs::remove_file(&api_socket).await;
        }

        let mut cmd = Command::new(self.binary());
        cmd.arg("--api-socket")
            .arg(format!("path={}", api_socket.display()));

        // The VM must come up inside the pod's netns; enter it on the
        // child between fork and exec.
        if let Some(netns) = netns {
            let netns = netns.to_path_buf();
            unsafe {
                cmd.pre_exec(move || {
                    let f = std::fs::File::open(&netns)?;
                    nix::sched::setns(&f, nix::sched::CloneFlags::CLONE_NEWNET)
                        .map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }

        let stdout_path = self.vm_dir.join("hypervisor.stdout");
        let stderr_path = self.vm_dir.join("hypervisor.stderr");
        cmd.stdout(std::fs::File::create(&stdout_path)?);
        cmd.stderr(std::fs::File::create(&stderr_path)?);

        info!(pod_id = %self.pod_id, cmd = ?cmd.as_std(), "Spawning hypervisor");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::HypervisorFailure(format!("spawn: {e}")))?;

        // Catch immediate exits before waiting on the API socket.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let stderr = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            return Err(Error::HypervisorFailure(format!(
                "hypervisor exited immediately ({status}): {stderr}"
            )));
        }
        self.child = Some(child);

        self.wait_api_socket().await?;
        self.api_request("vm.create", Some(self.vm_config_json()))
            .await?;
        self.api_request("vm.boot", None).await?;

        self.state = VmmState::Running;
        info!(pod_id = %self.pod_id, "Hypervisor started");
        Ok(())
    }

    async fn wait_pod(&mut self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.api_request("vm.info", None).await {
                Ok(body) => {
                    if let Ok(info) = serde_json::from_slice::<serde_json::Value>(&body)
                        && info["state"] == "Running"
                    {
                        return Ok(());
                    }
                }
                Err(e) => debug!(pod_id = %self.pod_id, error = %e, "VM not answering yet"),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for VM".into()));
            }
            tokio::time::sleep(API_SOCKET_RETRY).await;
        }
    }

    async fn stop_pod(&mut self) -> Result<()> {
        if self.api_socket().exists() {
            info!(pod_id = %self.pod_id, "Sending shutdown request");
            if let Err(e) = self.api_request("vm.shutdown", None).await {
                warn!(pod_id = %self.pod_id, error = %e, "Shutdown request failed");
            }
        }

        if self.child.is_some() {
            let deadline = tokio::time::Instant::now() + SHUTDOWN_WAIT;
            loop {
                let exited = self
                    .child
                    .as_mut()
                    .map(|c| matches!(c.try_wait(), Ok(Some(_))))
                    .unwrap_or(true);
                if exited {
                    self.child = None;
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(pod_id = %self.pod_id, "Timeout waiting for graceful shutdown, killing");
                    self.kill_vmm().await;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if self.vm_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&self.vm_dir).await;
        }
        self.state = VmmState::NotCreated;
        Ok(())
    }

    async fn pause_pod(&mut self) -> Result<()> {
        self.api_request("vm.pause", None).await?;
        self.state = VmmState::Paused;
        Ok(())
    }

    async fn resume_pod(&mut self) -> Result<()> {
        self.api_request("vm.resume", None).await?;
        self.state = VmmState::Running;
        Ok(())
    }

    fn console_path(&self) -> PathBuf {
        self.vm_dir.join("console.sock")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            block_device_hotplug: true,
            multi_queue: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpod_shared::config::{HypervisorType, Param};
    use vpod_shared::volumes::Volume;
    use crate::{Drive, NetDevice};

    async fn staged_hypervisor() -> CloudHypervisor {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PodConfig {
            id: "pod-1".into(),
            hypervisor_type: HypervisorType::CloudHypervisor,
            hypervisor_config: HypervisorConfig {
                kernel_path: "/usr/share/vpod/vmlinuz".into(),
                image_path: "/usr/share/vpod/image.img".into(),
                kernel_params: vec![Param::new("root", "/dev/pmem0")],
                ..Default::default()
            },
            ..Default::default()
        };
        config.storage_roots.run_root = dir.path().to_path_buf();
        config.validate().unwrap();

        let mut ch = CloudHypervisor::new();
        ch.init(&config.hypervisor_config).await.unwrap();
        ch.create_pod(&config).await.unwrap();
        ch
    }

    #[tokio::test]
    async fn test_vm_definition_composition() {
        let mut ch = staged_hypervisor().await;
        ch.add_device(DeviceData::Fs(Volume {
            mount_tag: "shared".into(),
            host_path: "/run/vpod/pod-1/shared".into(),
        }))
        .await
        .unwrap();
        ch.add_device(DeviceData::Net(NetDevice {
            tap_name: "tap0_vpod".into(),
            mac_addr: "02:00:ca:fe:00:00".into(),
        }))
        .await
        .unwrap();
        ch.add_device(DeviceData::Block(Drive {
            path: "/dev/sdb".into(),
            index: 0,
            readonly: false,
        }))
        .await
        .unwrap();

        let vm = ch.vm_config_json();
        // Boot image first, then staged drives.
        assert_eq!(vm["disks"][0]["path"], "/usr/share/vpod/image.img");
        assert_eq!(vm["disks"][1]["path"], "/dev/sdb");
        assert_eq!(vm["net"][0]["tap"], "tap0_vpod");
        assert_eq!(vm["fs"][0]["tag"], "shared");
        // Shared filesystems force shared memory.
        assert_eq!(vm["memory"]["shared"], true);

        let cmdline = vm["payload"]["cmdline"].as_str().unwrap();
        assert!(cmdline.starts_with("reboot=k"));
        assert!(cmdline.ends_with("root=/dev/pmem0"));
    }

    #[tokio::test]
    async fn test_devices_stage_until_boot() {
        let mut ch = staged_hypervisor().await;
        // No VM is running, so nothing tries to hotplug.
        ch.add_device(DeviceData::Vfio { bdf: "02:10.0".into() })
            .await
            .unwrap();
        assert_eq!(ch.devices.len(), 2); // image + vfio

        let vm = ch.vm_config_json();
        assert_eq!(
            vm["devices"][0]["path"],
            "/sys/bus/pci/devices/0000:02:10.0"
        );
    }
}
