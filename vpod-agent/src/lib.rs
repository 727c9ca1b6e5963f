//! Guest agent transports.
//!
//! The [`Agent`] trait is the orchestrator's view of the in-guest
//! supervisor; the [`Proxy`] trait is the channel the agent's
//! commands travel over. Both are object-safe so pods can mix and
//! match implementations chosen from configuration.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use vpod_shared::Result;
use vpod_shared::config::{Cmd, ContainerConfig, PodConfig};
use vpod_shared::netinfo::GuestNetworkInfo;
use vpod_hypervisor::Hypervisor;

pub mod cmd;
pub mod hyper;
pub mod noop;
pub mod oci;

pub use cmd::{AgentCmd, AgentResponse, Storage};
pub use hyper::HyperAgent;
pub use noop::NoopAgent;

/// Parameters for spawning the proxy process.
#[derive(Debug, Clone, Default)]
pub struct ProxyStartParams {
    pub pod_id: String,
    /// Directory the listen socket lives in.
    pub run_dir: PathBuf,
    /// Agent channel the proxy muxes onto.
    pub agent_url: String,
    /// Hypervisor console, forwarded for agent logs in debug mode.
    pub console_path: PathBuf,
    pub debug: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterResult {
    /// Proxy URL shim sessions connect to.
    pub url: String,
    /// One token per registered container.
    pub tokens: Vec<String>,
}

/// Host-side multiplexer owning the single VM channel.
#[async_trait]
pub trait Proxy: Send {
    /// Spawn the proxy process; returns its pid and listen URL.
    async fn start(&mut self, params: &ProxyStartParams) -> Result<(u32, String)>;

    /// Register the pod, minting one token per container.
    async fn register(&mut self, pod_id: &str, num_tokens: usize) -> Result<RegisterResult>;

    /// Attach to an existing registration. Mints a fresh token when
    /// `create_token` is set (exec flows), otherwise returns None.
    async fn connect(
        &mut self,
        pod_id: &str,
        url: &str,
        create_token: bool,
    ) -> Result<Option<String>>;

    /// Detach and kill the proxy process. `proxy_pid` is the pid
    /// recorded in the pod's persisted state; implementations fall
    /// back to it when they did not spawn the process themselves.
    async fn unregister(&mut self, proxy_pid: u32) -> Result<()>;

    /// Dispatch one typed agent request. Implementations serialize
    /// internally; the channel is single-writer.
    async fn send_cmd(&mut self, cmd: AgentCmd) -> Result<AgentResponse>;
}

/// In-guest supervisor driven by the orchestrator.
#[async_trait]
pub trait Agent: Send {
    async fn init(&mut self, config: &PodConfig) -> Result<()>;

    /// Channel URL the proxy muxes (the agent side of the wire).
    fn vm_url(&self) -> String;

    /// Host directory shared into the guest for this pod, if the
    /// agent uses one.
    fn host_shared_dir(&self, config: &PodConfig) -> Option<PathBuf>;

    /// Guest-side rootfs directory for a container.
    fn guest_rootfs(&self, container_id: &str) -> String;

    /// Guest-side path for a container's bind mount slot.
    fn guest_mount_point(&self, container_id: &str, index: usize) -> String;

    /// Wire the agent's channels and shared volumes into the VM
    /// definition. Runs between hypervisor create and start.
    async fn create_pod(
        &mut self,
        hypervisor: &mut dyn Hypervisor,
        config: &PodConfig,
    ) -> Result<()>;

    async fn start_pod(
        &mut self,
        proxy: &mut dyn Proxy,
        config: &PodConfig,
        netinfo: &GuestNetworkInfo,
    ) -> Result<()>;

    async fn stop_pod(&mut self, proxy: &mut dyn Proxy, config: &PodConfig) -> Result<()>;

    async fn create_container(
        &mut self,
        proxy: &mut dyn Proxy,
        container: &ContainerConfig,
        storages: Vec<Storage>,
        guest_mounts: &HashMap<String, String>,
    ) -> Result<()>;

    async fn start_container(&mut self, proxy: &mut dyn Proxy, container_id: &str) -> Result<()>;

    async fn stop_container(&mut self, proxy: &mut dyn Proxy, container_id: &str) -> Result<()>;

    async fn exec_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        cmd: &Cmd,
    ) -> Result<()>;

    /// Signal one process, or every process of the container when
    /// `all` is set.
    async fn signal_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<()>;

    async fn wait_process(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<i32>;

    async fn read_stdout(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Vec<u8>>;

    async fn read_stderr(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<Vec<u8>>;

    async fn write_stdin(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        data: &[u8],
    ) -> Result<()>;

    async fn close_stdin(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
    ) -> Result<()>;

    async fn tty_resize(
        &mut self,
        proxy: &mut dyn Proxy,
        container_id: &str,
        exec_id: &str,
        rows: u16,
        cols: u16,
    ) -> Result<()>;
}
