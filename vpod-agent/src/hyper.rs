//! hyperstart-style agent.
//!
//! Talks to the in-guest supervisor over two virtio-serial channels
//! (control and tty), muxed by the proxy. Container filesystems reach
//! the guest through one shared 9p mount; block rootfs devices are
//! described as storages instead.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use vpod_shared::config::{AgentConfig, Cmd, ContainerConfig, PodConfig};
use vpod_shared::netinfo::GuestNetworkInfo;
use vpod_shared::volumes::{Socket, Volume};
use vpod_shared::{Error, Result};
use vpod_hypervisor::{DeviceData, Hypervisor};

use crate::{Agent, AgentCmd, AgentResponse, Proxy, Storage};

/// Mount tag and guest location of the pod's shared 9p tree.
const SHARED_MOUNT_TAG: &str = "shared";
const GUEST_SHARED_DIR: &str = "/run/vpod/shared";

#[derive(Debug, Default)]
pub struct HyperAgent {
    pod_id: String,
    run_dir: PathBuf,
    sockets: Vec<Socket>,
    shared_paths: Vec<PathBuf>,
}

impl HyperAgent {
    pub fn new() -> Self {
        Self::default()
    }

    fn default_sockets(run_dir: &PathBuf) -> Vec<Socket> {
        vec![
            Socket {
                device_id: "channel0".into(),
                id: "charch0".into(),
                host_path: run_dir.join("hyper.sock").display().to_string(),
                name: "sh.hyper.channel.0".into(),
            },
            Socket {
                device_id: "channel1".into(),
                id: "charch1".into(),
                host_path: run_dir.join("tty.sock").display().to_string(),
                name: "sh.hyper.channel.1".into(),
            },
        ]
    }

    async fn dispatch(proxy: &mut dyn Proxy, cmd: AgentCmd) -> Result<AgentResponse> {
        match proxy.send_cmd(cmd).await? {
            AgentResponse::Error { message } => Err(Error::AgentFailure(message)),
            resp => Ok(resp),
        }
    }
}

#[async_trait]
impl Agent for HyperAgent {
    async fn init(&mut self, config: &PodConfig) -> Result<()> {
        let (sockets, shared_paths) = match &config.agent {
            AgentConfig::Hyper {
                sockets,
                shared_paths,
            } => (sockets.0.clone(), shared_paths.clone()),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "hyper agent given {other:?} configuration"
                )));
            }
        };

        self.pod_id = config.id.clone();
        self.run_dir = config.storage_roots.run_root.join(&config.id);
        self.sockets = if sockets.is_empty() {
            Self::default_sockets(&self.run_dir)
        } else {
            sockets
        };
        self.shared_paths = shared_paths;
        Ok(())
    }

    fn vm_url(&self) -> String {
        self.sockets
            .first()
            .map(|s| s.host_path.clone())
            .unwrap_or_default()
    }

    fn host_shared_dir(&self, config: &PodConfig) -> Option<PathBuf> {
        Some(
            config
                .storage_roots
                .run_root
                .join(&config.id)
                .join(SHARED_MOUNT_TAG),
        )
    }

    fn guest_rootfs(&self, container_id: &str) -> String {
        format!("{GUEST_SHARED_DIR}/{container_id}/rootfs")
    }

    fn guest_mount_point(&self, container_id: &str, index: usize) -> String {
        format!("{GUEST_SHARED_DIR}/{container_id}/mounts/{index}")
    }

    async fn create_pod(
        &mut self,
        hypervisor: &mut dyn Hypervisor,
        config: &PodConfig,
    ) -> Result<()> {
        // The pod's shared tree, then user volumes, then the two
        // agent channels.
        if let Some(shared_dir) = self.host_shared_dir(config) {
            hypervisor
                .add_device(DeviceData::Fs(Volume {
                    mount_tag: SHARED_MOUNT_TAG.into(),
                    host_path: shared_dir,
                }))
                .await?;
        }
        for volume in &config.volumes.0 {
            hypervisor
                .add_device(DeviceData::Fs(volume.clone()))
                .await?;
        }
        for (i, path) in self.shared_paths.iter().enumerate() {
            hypervisor
                .add_device(DeviceData::Fs(Volume {
                    mount_tag: format!("extra{i}"),
                    host_path: path.clone(),
                }))
                .await?;
        }
        for socket in &self.sockets {
            hypervisor
                .add_device(DeviceData::SerialPort(socket.clone()))
                .await?;
        }
        info!(pod_id = %config.id, channels = self.sockets.len(), "Agent devices staged");
        Ok(())
    }

    async fn start_pod(
        &mut self,
        proxy: &mut dyn Proxy,
        config: &PodConfig,
        netinfo: &GuestNetworkInfo,
    ) -> Result<()> {
        let shared_storages = vec![Storage {
            driver: "9p".into(),
            source: SHARED_MOUNT_TAG.into(),
            mount_point: GUEST_SHARED_DIR.into(),
            fstype: "9p".into(),
            options: vec!["trans=virtio".into(), "nodev".into()],
        }];
        Self::dispatch(
            proxy,
            AgentCmd::CreateSandbox {
                hostname: config.id.clone(),
                shared_storages,
                dns: netinfo.dns.clone(),
            },
        )
        .await?;

        for interface in &netinfo.interfaces {
            Self::dispatch(proxy, AgentCmd::AddInterface(interface.clone())).await?;
        }
        if !netinfo.routes.is_empty() {
            Self::dispatch(proxy, AgentCmd::AddRoute(netinfo.routes.clone())).await?;
        }
        Self::dispatch(proxy, AgentCmd::OnlineCpuMem).await?;

        debug!(pod_id = %config.id, "Sandbox created in guest");
        Ok(())
    }

    async fn stop_pod(&mut self, proxy: &mut dyn Proxy, config: &PodConfig) -> Result<()> {
        Self::dispatch(proxy, AgentCmd::DestroySandbox).await?;
        debug!(pod_id = %config.id, "Sandbox destroyed in guest");
        Ok(())
    }

    async fn create_container(
        &mut self,
        proxy: &mut dyn Proxy,
        container: &ContainerConfig,
        storages: Vec<Storage>,
        guest_mounts: &HashMap<String, String>,
    ) -> Result<()> {
        let spec = crate::oci::spec_from_config(
            container,
            &self.pod_id,
            &self.guest_rootfs(&container.id),
            guest_mounts,
        )?;
        Self::dispatch(
            proxy,
            AgentCmd::CreateContainer {
                container_id: container.id.clone(),
                storages,
                spec,
            },
        )
        .await?;
        Ok(())
    }

    async fn start_container(&mut self, proxy: &mut dyn Proxy, container_id: &str) -> Result<()> {
        Self::dispatch(
            proxy,
            AgentCmd::StartContainer {
                container_id: container_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn stop_container(&mut self, proxy: &mut dyn Proxy, container_id: &str) -> Result<()> {
        Self::dispatch(
            proxy,
            AgentCmd::RemoveContainer {
                container_id: container_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn exec_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        cmd: &Cmd,
    ) -> Result<()> {
        let process = crate::oci::process_from_cmd(cmd)?;
        Self::dispatch(
            proxy,
            AgentCmd::ExecProcess {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                process,
            },
        )
        .await?;
        Ok(())
    }

    async fn signal_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<()> {
        // An empty exec id targets every process in the container.
        let exec_id = if all { String::new() } else { exec_id.to_string() };
        Self::dispatch(
            proxy,
            AgentCmd::SignalProcess {
                container_id: container_id.to_string(),
                exec_id,
                signal,
            },
        )
        .await?;
        Ok(())
    }

    async fn wait_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<i32> {
        match Self::dispatch(
            proxy,
            AgentCmd::WaitProcess {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            },
        )
        .await?
        {
            AgentResponse::ExitCode { code } => Ok(code),
            _ => Ok(0),
        }
    }

    async fn read_stdout(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Vec<u8>> {
        match Self::dispatch(
            proxy,
            AgentCmd::ReadStdout {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            },
        )
        .await?
        {
            AgentResponse::Data { data } => Ok(data),
            _ => Ok(Vec::new()),
        }
    }

    async fn read_stderr(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Vec<u8>> {
        match Self::dispatch(
            proxy,
            AgentCmd::ReadStderr {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            },
        )
        .await?
        {
            AgentResponse::Data { data } => Ok(data),
            _ => Ok(Vec::new()),
        }
    }

    async fn write_stdin(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        data: &[u8],
    ) -> Result<()> {
        Self::dispatch(
            proxy,
            AgentCmd::WriteStdin {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                data: data.to_vec(),
            },
        )
        .await?;
        Ok(())
    }

    async fn close_stdin(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<()> {
        Self::dispatch(
            proxy,
            AgentCmd::CloseStdin {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    async fn tty_resize(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<()> {
        Self::dispatch(
            proxy,
            AgentCmd::TtyResize {
                container_id: container_id.to_string(),
                exec_id: exec_id.to_string(),
                rows,
                cols,
            },
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpod_shared::config::HypervisorConfig;
    use crate::{ProxyStartParams, RegisterResult};

    /// Proxy double that records every dispatched command.
    #[derive(Default)]
    struct RecordingProxy {
        sent: Vec<AgentCmd>,
    }

    #[async_trait]
    impl Proxy for RecordingProxy {
        async fn start(&mut self, _params: &ProxyStartParams) -> Result<(u32, String)> {
            Ok((0, "test://".into()))
        }

        async fn register(&mut self, _pod_id: &str, num_tokens: usize) -> Result<RegisterResult> {
            Ok(RegisterResult {
                url: "test://".into(),
                tokens: vec![String::from("t"); num_tokens],
            })
        }

        async fn connect(
            &mut self,
            _pod_id: &str,
            _url: &str,
            create_token: bool,
        ) -> Result<Option<String>> {
            Ok(create_token.then(|| "t".to_string()))
        }

        async fn unregister(&mut self, _proxy_pid: u32) -> Result<()> {
            Ok(())
        }

        async fn send_cmd(&mut self, cmd: AgentCmd) -> Result<AgentResponse> {
            self.sent.push(cmd);
            Ok(AgentResponse::Ok)
        }
    }

    fn hyper_pod_config() -> PodConfig {
        let mut config = PodConfig {
            id: "pod-1".into(),
            agent: AgentConfig::Hyper {
                sockets: Default::default(),
                shared_paths: Vec::new(),
            },
            hypervisor_config: HypervisorConfig {
                kernel_path: "/boot/vmlinuz".into(),
                image_path: "/img.img".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn test_init_synthesizes_channel_sockets() {
        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        assert_eq!(agent.sockets.len(), 2);
        assert!(agent.vm_url().ends_with("hyper.sock"));
    }

    #[tokio::test]
    async fn test_init_rejects_foreign_config() {
        let mut config = hyper_pod_config();
        config.agent = AgentConfig::Noop;
        let mut agent = HyperAgent::new();
        assert!(agent.init(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_create_pod_stages_devices() {
        use vpod_hypervisor::MockHypervisor;

        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        let mut hypervisor = MockHypervisor::new();
        agent.create_pod(&mut hypervisor, &config).await.unwrap();

        let fs = hypervisor
            .devices
            .iter()
            .filter(|d| matches!(d, DeviceData::Fs(_)))
            .count();
        let serial_ports = hypervisor
            .devices
            .iter()
            .filter(|d| matches!(d, DeviceData::SerialPort(_)))
            .count();
        assert_eq!(fs, 1);
        assert_eq!(serial_ports, 2);
    }

    #[tokio::test]
    async fn test_start_pod_command_sequence() {
        use vpod_shared::netinfo::{GuestInterface, GuestRoute};

        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        let netinfo = GuestNetworkInfo {
            interfaces: vec![GuestInterface {
                device: "eth0".into(),
                name: "eth0".into(),
                ..Default::default()
            }],
            routes: vec![GuestRoute {
                dest: "default".into(),
                gateway: "10.0.0.1".into(),
                device: "eth0".into(),
            }],
            ..Default::default()
        };

        let mut proxy = RecordingProxy::default();
        agent.start_pod(&mut proxy, &config, &netinfo).await.unwrap();

        assert!(matches!(
            &proxy.sent[0],
            AgentCmd::CreateSandbox { hostname, shared_storages, .. }
                if hostname == "pod-1" && shared_storages[0].driver == "9p"
        ));
        assert!(matches!(&proxy.sent[1], AgentCmd::AddInterface(_)));
        assert!(matches!(&proxy.sent[2], AgentCmd::AddRoute(routes) if routes.len() == 1));
        assert!(matches!(proxy.sent.last(), Some(AgentCmd::OnlineCpuMem)));
    }

    #[tokio::test]
    async fn test_create_container_sends_guest_rooted_spec() {
        use std::collections::HashMap;
        use vpod_shared::config::{Cmd, ContainerConfig};

        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        let container = ContainerConfig {
            id: "c1".into(),
            rootfs: "/host/rootfs".into(),
            cmd: Cmd {
                args: vec!["/bin/sh".into()],
                ..Default::default()
            },
            ..Default::default()
        };

        let mut proxy = RecordingProxy::default();
        agent
            .create_container(&mut proxy, &container, Vec::new(), &HashMap::new())
            .await
            .unwrap();

        match &proxy.sent[0] {
            AgentCmd::CreateContainer { container_id, spec, .. } => {
                assert_eq!(container_id, "c1");
                assert_eq!(spec.root.path, "/run/vpod/shared/c1/rootfs");
                assert!(spec.hooks.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_signal_all_clears_exec_id() {
        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        let mut proxy = RecordingProxy::default();
        agent
            .signal_process(&mut proxy, "c1", "tok", 9, true)
            .await
            .unwrap();
        agent
            .signal_process(&mut proxy, "c1", "tok", 15, false)
            .await
            .unwrap();

        assert!(matches!(
            &proxy.sent[0],
            AgentCmd::SignalProcess { exec_id, signal: 9, .. } if exec_id.is_empty()
        ));
        assert!(matches!(
            &proxy.sent[1],
            AgentCmd::SignalProcess { exec_id, signal: 15, .. } if exec_id == "tok"
        ));
    }

    #[tokio::test]
    async fn test_process_io_commands() {
        let config = hyper_pod_config();
        let mut agent = HyperAgent::new();
        agent.init(&config).await.unwrap();

        let mut proxy = RecordingProxy::default();
        // The recording proxy answers Ok to everything, so the data
        // ops fall back to their empty defaults.
        assert_eq!(agent.wait_process(&mut proxy, "c1", "t").await.unwrap(), 0);
        assert!(agent.read_stdout(&mut proxy, "c1", "t").await.unwrap().is_empty());
        assert!(agent.read_stderr(&mut proxy, "c1", "t").await.unwrap().is_empty());
        agent.write_stdin(&mut proxy, "c1", "t", b"ls\n").await.unwrap();
        agent.close_stdin(&mut proxy, "c1", "t").await.unwrap();
        agent.tty_resize(&mut proxy, "c1", "t", 40, 80).await.unwrap();

        let kinds: Vec<&'static str> = proxy
            .sent
            .iter()
            .map(|cmd| match cmd {
                AgentCmd::WaitProcess { .. } => "wait",
                AgentCmd::ReadStdout { .. } => "stdout",
                AgentCmd::ReadStderr { .. } => "stderr",
                AgentCmd::WriteStdin { data, .. } => {
                    assert_eq!(data, b"ls\n");
                    "stdin"
                }
                AgentCmd::CloseStdin { .. } => "close",
                AgentCmd::TtyResize { rows: 40, cols: 80, .. } => "resize",
                other => panic!("unexpected command {other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["wait", "stdout", "stderr", "stdin", "close", "resize"]
        );
    }

    #[test]
    fn test_guest_paths() {
        let agent = HyperAgent::new();
        assert_eq!(
            agent.guest_rootfs("c1"),
            "/run/vpod/shared/c1/rootfs"
        );
        assert_eq!(
            agent.guest_mount_point("c1", 2),
            "/run/vpod/shared/c1/mounts/2"
        );
    }
}
