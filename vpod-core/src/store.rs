//! Persistent pod store.
//!
//! Flat JSON tree under two roots: the config root survives reboots,
//! the run root is ephemeral. Every mutating public operation runs
//! under the pod's advisory file lock; read-only status calls share
//! it. Locks release on drop, so every exit path gives the lock back,
//! unwinds included.
//!
//! ```text
//! <config>/<podID>/config.json
//! <config>/<podID>/<containerID>/config.json
//! <run>/<podID>/state.json
//! <run>/<podID>/network.json
//! <run>/<podID>/lock
//! <run>/<podID>/<containerID>/{state,process,mounts,devices}.json
//! ```

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use vpod_shared::config::{ContainerConfig, Mount, PodConfig, StorageRoots};
use vpod_shared::state::{ContainerState, PodState, Process};
use vpod_shared::{Error, Result};
use vpod_net::NetworkNamespace;

use crate::device::Device;

const POD_CONFIG_FILE: &str = "config.json";
const POD_STATE_FILE: &str = "state.json";
const NETWORK_FILE: &str = "network.json";
const LOCK_FILE: &str = "lock";
const PROCESS_FILE: &str = "process.json";
const MOUNTS_FILE: &str = "mounts.json";
const DEVICES_FILE: &str = "devices.json";

/// Held for the duration of an operation; dropping releases the
/// advisory lock.
pub struct PodLock {
    _flock: Flock<File>,
}

#[derive(Debug, Clone)]
pub struct Store {
    config_root: PathBuf,
    run_root: PathBuf,
}

impl Store {
    pub fn new(roots: &StorageRoots) -> Self {
        Self {
            config_root: roots.config_root.clone(),
            run_root: roots.run_root.clone(),
        }
    }

    pub fn pod_config_dir(&self, pod_id: &str) -> PathBuf {
        self.config_root.join(pod_id)
    }

    pub fn pod_run_dir(&self, pod_id: &str) -> PathBuf {
        self.run_root.join(pod_id)
    }

    fn container_config_dir(&self, pod_id: &str, container_id: &str) -> PathBuf {
        self.pod_config_dir(pod_id).join(container_id)
    }

    fn container_run_dir(&self, pod_id: &str, container_id: &str) -> PathBuf {
        self.pod_run_dir(pod_id).join(container_id)
    }

    fn lock_path(&self, pod_id: &str) -> PathBuf {
        self.pod_run_dir(pod_id).join(LOCK_FILE)
    }

    pub fn pod_exists(&self, pod_id: &str) -> bool {
        self.pod_config_dir(pod_id).join(POD_CONFIG_FILE).exists()
    }

    /// Allocate the directory tree and the lock file. Idempotent.
    pub fn create_all_resources(&self, config: &PodConfig) -> Result<()> {
        std::fs::create_dir_all(self.pod_config_dir(&config.id))?;
        std::fs::create_dir_all(self.pod_run_dir(&config.id))?;
        for container in &config.containers {
            self.create_container_resources(&config.id, &container.id)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(&config.id))?;
        debug!(pod_id = %config.id, "Pod resources allocated");
        Ok(())
    }

    pub fn create_container_resources(&self, pod_id: &str, container_id: &str) -> Result<()> {
        std::fs::create_dir_all(self.container_config_dir(pod_id, container_id))?;
        std::fs::create_dir_all(self.container_run_dir(pod_id, container_id))?;
        Ok(())
    }

    /// Remove everything the pod owns under both roots. Idempotent.
    pub fn delete_pod_resources(&self, pod_id: &str) -> Result<()> {
        for dir in [self.pod_config_dir(pod_id), self.pod_run_dir(pod_id)] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::PersistenceIo(e)),
            }
        }
        debug!(pod_id, "Pod resources deleted");
        Ok(())
    }

    pub fn delete_container_resources(&self, pod_id: &str, container_id: &str) -> Result<()> {
        for dir in [
            self.container_config_dir(pod_id, container_id),
            self.container_run_dir(pod_id, container_id),
        ] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::PersistenceIo(e)),
            }
        }
        Ok(())
    }

    /// Shared advisory lock for read-only status operations.
    pub fn rlock_pod(&self, pod_id: &str) -> Result<PodLock> {
        self.flock(pod_id, FlockArg::LockShared)
    }

    /// Exclusive advisory lock for mutating operations.
    pub fn rwlock_pod(&self, pod_id: &str) -> Result<PodLock> {
        self.flock(pod_id, FlockArg::LockExclusive)
    }

    fn flock(&self, pod_id: &str, arg: FlockArg) -> Result<PodLock> {
        let path = self.lock_path(pod_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(format!("pod {pod_id}")),
                _ => Error::PersistenceIo(e),
            })?;
        let flock = Flock::lock(file, arg)
            .map_err(|(_, errno)| Error::PersistenceIo(std::io::Error::from(errno)))?;
        Ok(PodLock { _flock: flock })
    }

    // One-shot write-through JSON I/O.

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
        let data = std::fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(what.to_string()),
            _ => Error::PersistenceIo(e),
        })?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::CorruptState(format!("{what}: {e}")))
    }

    pub fn store_pod_config(&self, config: &PodConfig) -> Result<()> {
        Self::write_json(
            &self.pod_config_dir(&config.id).join(POD_CONFIG_FILE),
            config,
        )
    }

    pub fn fetch_pod_config(&self, pod_id: &str) -> Result<PodConfig> {
        Self::read_json(
            &self.pod_config_dir(pod_id).join(POD_CONFIG_FILE),
            &format!("pod {pod_id}"),
        )
    }

    pub fn store_container_config(&self, pod_id: &str, config: &ContainerConfig) -> Result<()> {
        Self::write_json(
            &self
                .container_config_dir(pod_id, &config.id)
                .join(POD_CONFIG_FILE),
            config,
        )
    }

    pub fn fetch_container_config(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<ContainerConfig> {
        Self::read_json(
            &self
                .container_config_dir(pod_id, container_id)
                .join(POD_CONFIG_FILE),
            &format!("container {container_id}"),
        )
    }

    pub fn store_pod_state(&self, pod_id: &str, state: &PodState) -> Result<()> {
        Self::write_json(&self.pod_run_dir(pod_id).join(POD_STATE_FILE), state)
    }

    pub fn fetch_pod_state(&self, pod_id: &str) -> Result<PodState> {
        Self::read_json(
            &self.pod_run_dir(pod_id).join(POD_STATE_FILE),
            &format!("pod {pod_id} state"),
        )
    }

    pub fn pod_state_exists(&self, pod_id: &str) -> bool {
        self.pod_run_dir(pod_id).join(POD_STATE_FILE).exists()
    }

    pub fn store_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
        state: &ContainerState,
    ) -> Result<()> {
        Self::write_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(POD_STATE_FILE),
            state,
        )
    }

    pub fn fetch_container_state(
        &self,
        pod_id: &str,
        container_id: &str,
    ) -> Result<ContainerState> {
        Self::read_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(POD_STATE_FILE),
            &format!("container {container_id} state"),
        )
    }

    pub fn store_process(
        &self,
        pod_id: &str,
        container_id: &str,
        process: &Process,
    ) -> Result<()> {
        Self::write_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(PROCESS_FILE),
            process,
        )
    }

    pub fn fetch_process(&self, pod_id: &str, container_id: &str) -> Result<Process> {
        Self::read_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(PROCESS_FILE),
            &format!("container {container_id} process"),
        )
    }

    pub fn store_mounts(
        &self,
        pod_id: &str,
        container_id: &str,
        mounts: &[Mount],
    ) -> Result<()> {
        Self::write_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(MOUNTS_FILE),
            &mounts,
        )
    }

    pub fn fetch_mounts(&self, pod_id: &str, container_id: &str) -> Result<Vec<Mount>> {
        Self::read_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(MOUNTS_FILE),
            &format!("container {container_id} mounts"),
        )
    }

    /// Device documents persist as tagged `{type, data}` envelopes so
    /// the loader can rebuild the right variant; an unknown tag loads
    /// as corrupt state.
    pub fn store_devices(
        &self,
        pod_id: &str,
        container_id: &str,
        devices: &[Device],
    ) -> Result<()> {
        Self::write_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(DEVICES_FILE),
            &devices,
        )
    }

    pub fn fetch_devices(&self, pod_id: &str, container_id: &str) -> Result<Vec<Device>> {
        Self::read_json(
            &self
                .container_run_dir(pod_id, container_id)
                .join(DEVICES_FILE),
            &format!("container {container_id} devices"),
        )
    }

    pub fn store_network(&self, pod_id: &str, ns: &NetworkNamespace) -> Result<()> {
        Self::write_json(&self.pod_run_dir(pod_id).join(NETWORK_FILE), ns)
    }

    pub fn fetch_network(&self, pod_id: &str) -> Result<NetworkNamespace> {
        Self::read_json(
            &self.pod_run_dir(pod_id).join(NETWORK_FILE),
            &format!("pod {pod_id} network"),
        )
    }

    pub fn network_exists(&self, pod_id: &str) -> bool {
        self.pod_run_dir(pod_id).join(NETWORK_FILE).exists()
    }

    /// Ids of every pod with a persisted configuration.
    pub fn list_pods(&self) -> Result<Vec<String>> {
        let mut pods = Vec::new();
        let entries = match std::fs::read_dir(&self.config_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pods),
            Err(e) => return Err(Error::PersistenceIo(e)),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().join(POD_CONFIG_FILE).exists()
                && let Some(name) = entry.file_name().to_str()
            {
                pods.push(name.to_string());
            }
        }
        pods.sort();
        Ok(pods)
    }

    /// Container ids persisted under a pod's config directory.
    pub fn list_containers(&self, pod_id: &str) -> Result<Vec<String>> {
        let mut containers = Vec::new();
        let entries = match std::fs::read_dir(self.pod_config_dir(pod_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(containers),
            Err(e) => return Err(Error::PersistenceIo(e)),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().join(POD_CONFIG_FILE).exists()
                && entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                containers.push(name.to_string());
            }
        }
        containers.sort();
        Ok(containers)
    }
}
