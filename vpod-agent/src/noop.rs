//! Agent that does nothing, for pods driven without a guest
//! supervisor and for tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

use vpod_shared::Result;
use vpod_shared::config::{Cmd, ContainerConfig, PodConfig};
use vpod_shared::netinfo::GuestNetworkInfo;
use vpod_hypervisor::Hypervisor;

use crate::{Agent, Proxy, Storage};

#[derive(Debug, Default)]
pub struct NoopAgent;

impl NoopAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for NoopAgent {
    async fn init(&mut self, _config: &PodConfig) -> Result<()> {
        Ok(())
    }

    fn vm_url(&self) -> String {
        String::new()
    }

    fn host_shared_dir(&self, _config: &PodConfig) -> Option<PathBuf> {
        None
    }

    fn guest_rootfs(&self, _container_id: &str) -> String {
        String::new()
    }

    fn guest_mount_point(&self, _container_id: &str, _index: usize) -> String {
        String::new()
    }

    async fn create_pod(
        &mut self,
        _hypervisor: &mut dyn Hypervisor,
        _config: &PodConfig,
    ) -> Result<()> {
        Ok(())
    }

    async fn start_pod(
        &mut self,
        _proxy: &mut dyn Proxy,
        _config: &PodConfig,
        _netinfo: &GuestNetworkInfo,
    ) -> Result<()> {
        Ok(())
    }

    async fn stop_pod(&mut self, _proxy: &mut dyn Proxy, _config: &PodConfig) -> Result<()> {
        Ok(())
    }

    async fn create_container(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container: &ContainerConfig,
        _storages: Vec<Storage>,
        _guest_mounts: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn start_container(&mut self, _proxy: &mut dyn Proxy, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_container(&mut self, _proxy: &mut dyn Proxy, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn exec_process(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
        _cmd: &Cmd,
    ) -> Result<()> {
        Ok(())
    }

    async fn signal_process(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
        _signal: i32,
        _all: bool,
    ) -> Result<()> {
        Ok(())
    }

    async fn wait_process(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
    ) -> Result<i32> {
        Ok(0)
    }

    async fn read_stdout(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
    ) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn read_stderr(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
    ) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn write_stdin(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
        _data: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    async fn close_stdin(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn tty_resize(
        &mut self,
        _proxy: &mut dyn Proxy,
        _container_id: &str,
        _exec_id: &str,
        _rows: u16,
        _cols: u16,
    ) -> Result<()> {
        Ok(())
    }
}
