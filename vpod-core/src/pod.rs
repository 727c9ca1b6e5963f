//! Pod and container orchestration.
//!
//! A pod is one VM plus its containers; every public operation here
//! follows the same discipline: take the pod's exclusive lock, re-read
//! persisted state, check the transition, act, persist, and let the
//! lock release on drop, unwinds included.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use vpod_shared::config::{ContainerConfig, Mount, PodConfig, StorageRoots};
use vpod_shared::state::{
    ContainerState, PodState, Process, RunState, check_container_transition,
    check_pod_transition,
};
use vpod_shared::{Error, Result};
use vpod_agent::{Agent, Proxy, ProxyStartParams, Storage};
use vpod_hypervisor::{DeviceData, Drive, Hypervisor, WAIT_POD_TIMEOUT};
use vpod_net::{Network, NetworkNamespace, guest_network_info};
use vpod_proxy::{ShimManager, ShimParams};

use crate::device::{self, Device};
use crate::hooks::{self, HookState};
use crate::store::Store;
use crate::{factory, mount};

/// Filesystem assumed for hotplugged block rootfs devices.
const BLOCK_ROOTFS_FSTYPE: &str = "ext4";

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct Container {
    pub config: ContainerConfig,
    pub state: ContainerState,
    pub process: Process,
    pub devices: Vec<Device>,
    /// Host bind mounts made for this container; destination is the
    /// path to unmount.
    pub mounts: Vec<Mount>,
}

pub struct Pod {
    pub config: PodConfig,
    pub state: PodState,
    pub containers: Vec<Container>,
    pub netns: NetworkNamespace,
    store: Store,
    hypervisor: Box<dyn Hypervisor>,
    agent: Box<dyn Agent>,
    proxy: Box<dyn Proxy>,
    shim: ShimManager,
    network: Box<dyn Network>,
}

impl Pod {
    /// The createPod pipeline: validate, build subsystems, allocate
    /// resources, stage the VM definition, and persist Ready state.
    pub async fn create(mut config: PodConfig) -> Result<Pod> {
        config.validate()?;
        let store = Store::new(&config.storage_roots);
        if store.pod_exists(&config.id) {
            return Err(Error::AlreadyExists(format!("pod {}", config.id)));
        }

        store.create_all_resources(&config)?;
        match Self::create_locked(&store, config.clone()).await {
            Ok(pod) => Ok(pod),
            Err(e) => {
                // Nothing has started yet; reclaim the tree so a
                // retry starts clean.
                let _ = store.delete_pod_resources(&config.id);
                Err(e)
            }
        }
    }

    async fn create_locked(store: &Store, config: PodConfig) -> Result<Pod> {
        let _lock = store.rwlock_pod(&config.id)?;

        let mut hypervisor = factory::new_hypervisor(config.hypervisor_type);
        let mut agent = factory::new_agent(&config.agent)?;
        let proxy = factory::new_proxy(config.proxy_type, &config.proxy_config);
        let shim = factory::new_shim(config.shim_type, &config.shim_config)?;
        let network = factory::new_network(config.network_model);

        store.store_pod_config(&config)?;

        hypervisor.init(&config.hypervisor_config).await?;
        hypervisor.create_pod(&config).await?;
        agent.init(&config).await?;
        agent.create_pod(hypervisor.as_mut(), &config).await?;

        if let Some(shared) = agent.host_shared_dir(&config) {
            std::fs::create_dir_all(shared)?;
        }

        let prior_state = store.pod_state_exists(&config.id);
        let mut state = PodState::default();
        let mut containers = Vec::new();
        for container_config in config.containers.clone() {
            store.store_container_config(&config.id, &container_config)?;
            let container = Self::build_container(
                store,
                hypervisor.as_mut(),
                &config,
                &mut state,
                container_config,
            )
            .await?;
            containers.push(container);
        }

        if !prior_state {
            store.store_pod_state(&config.id, &state)?;
            for container in &containers {
                store.store_container_state(&config.id, &container.config.id, &container.state)?;
            }
        }

        info!(pod_id = %config.id, containers = containers.len(), "Pod created");
        Ok(Pod {
            netns: NetworkNamespace::default(),
            state,
            containers,
            store: store.clone(),
            hypervisor,
            agent,
            proxy,
            shim,
            network,
            config,
        })
    }

    /// Reconstruct a pod from its persisted records.
    pub async fn fetch(roots: &StorageRoots, pod_id: &str) -> Result<Pod> {
        let store = Store::new(roots);
        let config = store.fetch_pod_config(pod_id)?;

        let mut hypervisor = factory::new_hypervisor(config.hypervisor_type);
        let mut agent = factory::new_agent(&config.agent)?;
        let proxy = factory::new_proxy(config.proxy_type, &config.proxy_config);
        let shim = factory::new_shim(config.shim_type, &config.shim_config)?;
        let network = factory::new_network(config.network_model);

        hypervisor.init(&config.hypervisor_config).await?;
        hypervisor.create_pod(&config).await?;
        agent.init(&config).await?;

        let state = store.fetch_pod_state(pod_id)?;
        let netns = if store.network_exists(pod_id) {
            store.fetch_network(pod_id)?
        } else {
            NetworkNamespace::default()
        };

        let mut containers = Vec::new();
        for container_id in store.list_containers(pod_id)? {
            containers.push(Container {
                config: store.fetch_container_config(pod_id, &container_id)?,
                state: store.fetch_container_state(pod_id, &container_id)?,
                process: store.fetch_process(pod_id, &container_id).unwrap_or_default(),
                devices: store.fetch_devices(pod_id, &container_id).unwrap_or_default(),
                mounts: store.fetch_mounts(pod_id, &container_id).unwrap_or_default(),
            });
        }

        Ok(Pod {
            netns,
            state,
            containers,
            store,
            hypervisor,
            agent,
            proxy,
            shim,
            network,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    fn container_index(&self, container_id: &str) -> Result<usize> {
        self.containers
            .iter()
            .position(|c| c.config.id == container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))
    }

    fn hook_state(&self, status: &str) -> HookState {
        HookState::new(
            &self.config.id,
            status,
            &self.store.pod_config_dir(&self.config.id),
        )
    }

    fn netns_path(&self) -> Option<&Path> {
        if self.netns.path.as_os_str().is_empty() {
            None
        } else {
            Some(self.netns.path.as_path())
        }
    }

    fn persist_pod_state(&self) -> Result<()> {
        self.store.store_pod_state(&self.config.id, &self.state)
    }

    fn persist_container(&self, index: usize) -> Result<()> {
        let container = &self.containers[index];
        self.store
            .store_container_state(&self.config.id, &container.config.id, &container.state)?;
        self.store
            .store_process(&self.config.id, &container.config.id, &container.process)?;
        self.store
            .store_mounts(&self.config.id, &container.config.id, &container.mounts)?;
        self.store
            .store_devices(&self.config.id, &container.config.id, &container.devices)
    }

    /// Construct a container: resources, declared devices, and the
    /// block-rootfs reservation when the hypervisor supports it.
    async fn build_container(
        store: &Store,
        hypervisor: &mut dyn Hypervisor,
        config: &PodConfig,
        pod_state: &mut PodState,
        container_config: ContainerConfig,
    ) -> Result<Container> {
        store.create_container_resources(&config.id, &container_config.id)?;

        let mut container = Container {
            config: container_config,
            state: ContainerState::default(),
            process: Process::default(),
            devices: Vec::new(),
            mounts: Vec::new(),
        };

        for spec in container.config.devices.clone() {
            let mut dev = device::new_device(&spec)?;
            device::attach_device(&mut dev, hypervisor, pod_state).await?;
            container.devices.push(dev);
        }

        if hypervisor.capabilities().block_device_hotplug_supported()
            && is_block_device(&container.config.rootfs)
        {
            let slot = pod_state.block_index;
            pod_state.block_index += 1;
            let drive = Drive {
                path: container.config.rootfs.clone(),
                index: slot,
                readonly: false,
            };
            let virt_path = drive.virt_path();
            if let Err(e) = hypervisor.add_device(DeviceData::Block(drive)).await {
                pod_state.block_index -= 1;
                return Err(e);
            }
            container.state.fstype = BLOCK_ROOTFS_FSTYPE.into();
            container.state.block_index = slot;
            container.state.hotplugged_drive = virt_path.display().to_string();
        }

        store.store_container_state(&config.id, &container.config.id, &container.state)?;
        store.store_process(&config.id, &container.config.id, &container.process)?;
        store.store_mounts(&config.id, &container.config.id, &container.mounts)?;
        store.store_devices(&config.id, &container.config.id, &container.devices)?;
        Ok(container)
    }

    /// Bind container filesystems into the shared tree and describe
    /// the guest-side storages and mount mapping.
    fn setup_container_share(
        agent: &dyn Agent,
        config: &PodConfig,
        container: &mut Container,
    ) -> Result<(Vec<Storage>, HashMap<String, String>)> {
        let mut storages = Vec::new();
        let mut guest_mounts = HashMap::new();
        let container_id = container.config.id.clone();

        if !container.state.fstype.is_empty() {
            storages.push(Storage {
                driver: "blk".into(),
                source: container.state.hotplugged_drive.clone(),
                mount_point: agent.guest_rootfs(&container_id),
                fstype: container.state.fstype.clone(),
                options: Vec::new(),
            });
        } else if let Some(shared) = agent.host_shared_dir(config) {
            let target = shared.join(&container_id).join("rootfs");
            if mount::bind_mount(&container.config.rootfs, &target)? {
                container.mounts.push(Mount {
                    source: container.config.rootfs.clone(),
                    destination: target,
                    fstype: "bind".into(),
                    options: Vec::new(),
                });
            }
        }

        if let Some(shared) = agent.host_shared_dir(config) {
            for (i, m) in container.config.mounts.clone().iter().enumerate() {
                if !m.fstype.is_empty() && m.fstype != "bind" {
                    continue;
                }
                let target = shared.join(&container_id).join("mounts").join(i.to_string());
                if mount::bind_mount(&m.source, &target)? {
                    container.mounts.push(Mount {
                        source: m.source.clone(),
                        destination: target,
                        fstype: "bind".into(),
                        options: Vec::new(),
                    });
                }
                guest_mounts.insert(
                    m.destination.display().to_string(),
                    agent.guest_mount_point(&container_id, i),
                );
            }
        }

        Ok((storages, guest_mounts))
    }

    fn teardown_container_share(container: &mut Container) {
        for m in container.mounts.drain(..).rev() {
            if let Err(e) = mount::unmount(&m.destination) {
                warn!(path = %m.destination.display(), error = %e, "Unmount failed");
            }
        }
    }

    /// The startPod pipeline.
    pub async fn start(&mut self) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        check_pod_transition(self.state.state, RunState::Running)?;
        for container in &mut self.containers {
            container.state = self
                .store
                .fetch_container_state(&self.config.id, &container.config.id)?;
            if !matches!(container.state.state, RunState::Ready | RunState::Stopped) {
                return Err(Error::InvalidTransition {
                    from: container.state.state,
                    to: RunState::Running,
                });
            }
        }

        // Network first: hooks and the VM itself run inside the netns.
        self.netns = self
            .network
            .init(&self.config.id, &self.config.network_config)
            .await?;
        // Persisted immediately so an aborted start can still find
        // and reclaim a netns we created.
        self.store.store_network(&self.config.id, &self.netns)?;

        let hook_state = self.hook_state("created");
        hooks::run_hooks(
            &self.config.hooks.pre_start,
            &hook_state,
            self.netns_path(),
            true,
        )
        .await?;

        self.network
            .add(self.hypervisor.as_mut(), &self.config, &mut self.netns)
            .await?;
        self.store.store_network(&self.config.id, &self.netns)?;

        let netns_path = self.netns_path().map(Path::to_path_buf);
        if let Err(e) = self.boot_vm(netns_path.as_deref()).await {
            // The agent side is already wired up; a VM that will not
            // boot leaves nothing worth keeping.
            warn!(pod_id = %self.config.id, error = %e, "VM failed to start, rolling back");
            self.rollback_failed_start().await;
            return Err(e);
        }

        // Proxy and guest sandbox.
        if let Err(e) = self.start_guest().await {
            self.rollback_failed_start().await;
            return Err(e);
        }

        self.state.state = RunState::Running;
        self.persist_pod_state()?;

        self.start_all_containers().await?;

        let hook_state = self.hook_state("running");
        hooks::run_hooks(
            &self.config.hooks.post_start,
            &hook_state,
            self.netns_path(),
            false,
        )
        .await?;

        info!(pod_id = %self.config.id, "Pod started");
        Ok(())
    }

    async fn boot_vm(&mut self, netns: Option<&Path>) -> Result<()> {
        self.hypervisor.start_pod(netns).await?;
        self.hypervisor.wait_pod(WAIT_POD_TIMEOUT).await
    }

    async fn start_guest(&mut self) -> Result<()> {
        let run_dir = self.store.pod_run_dir(&self.config.id);
        let params = ProxyStartParams {
            pod_id: self.config.id.clone(),
            run_dir,
            agent_url: self.agent.vm_url(),
            console_path: self.hypervisor.console_path(),
            debug: self.config.proxy_config.debug,
        };
        let (pid, _url) = self.proxy.start(&params).await?;
        let registration = self
            .proxy
            .register(&self.config.id, self.containers.len())
            .await?;

        // The proxy URL is set exactly once per VM lifetime; stop
        // clears it again at unregister.
        self.state.url = registration.url;
        self.state.proxy_pid = pid;

        for (container, token) in self.containers.iter_mut().zip(registration.tokens) {
            container.process = Process {
                token,
                pid: 0,
                start_time: now(),
            };
        }
        for i in 0..self.containers.len() {
            self.persist_container(i)?;
        }

        let netinfo = guest_network_info(&self.netns.endpoints);
        self.agent
            .start_pod(self.proxy.as_mut(), &self.config, &netinfo)
            .await
    }

    async fn start_all_containers(&mut self) -> Result<()> {
        for i in 0..self.containers.len() {
            self.start_container_in_guest(i).await?;
        }
        Ok(())
    }

    async fn start_container_in_guest(&mut self, index: usize) -> Result<()> {
        let (storages, guest_mounts) = Self::setup_container_share(
            self.agent.as_ref(),
            &self.config,
            &mut self.containers[index],
        )?;

        let container = &self.containers[index];
        self.agent
            .create_container(
                self.proxy.as_mut(),
                &container.config,
                storages,
                &guest_mounts,
            )
            .await?;
        self.agent
            .start_container(self.proxy.as_mut(), &container.config.id)
            .await?;

        let shim_pid = self
            .shim
            .start(&ShimParams {
                container_id: container.config.id.clone(),
                token: container.process.token.clone(),
                url: self.state.url.clone(),
                console: container.config.cmd.console.clone(),
                detach: container.config.cmd.detach,
            })
            .await?;

        let container = &mut self.containers[index];
        container.process.pid = shim_pid;
        container.process.start_time = now();
        container.state.state = RunState::Running;
        self.persist_container(index)?;
        Ok(())
    }

    async fn rollback_failed_start(&mut self) {
        if let Err(e) = self.hypervisor.stop_pod().await {
            warn!(pod_id = %self.config.id, error = %e, "Rollback: hypervisor stop failed");
        }
        if let Err(e) = self.network.remove(&mut self.netns).await {
            warn!(pod_id = %self.config.id, error = %e, "Rollback: network teardown failed");
        }
        if let Err(e) = self.store.delete_pod_resources(&self.config.id) {
            warn!(pod_id = %self.config.id, error = %e, "Rollback: resource deletion failed");
        }
    }

    /// The stopPod pipeline. Stopping a pod that only ever reached
    /// Ready is a pure state change.
    pub async fn stop(&mut self) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;

        if self.state.state == RunState::Ready {
            self.state.state = RunState::Stopped;
            return self.persist_pod_state();
        }
        check_pod_transition(self.state.state, RunState::Stopped)?;

        // A pod reconstructed from disk has no live channel yet.
        if !self.state.url.is_empty()
            && let Err(e) = self
                .proxy
                .connect(&self.config.id, &self.state.url, false)
                .await
        {
            warn!(pod_id = %self.config.id, error = %e, "Proxy reconnect failed");
        }

        for container in &mut self.containers {
            container.state = self
                .store
                .fetch_container_state(&self.config.id, &container.config.id)?;
        }
        for i in 0..self.containers.len() {
            let container_state = self.containers[i].state.state;
            if matches!(container_state, RunState::Running | RunState::Paused) {
                if let Err(e) = self.stop_container_in_guest(i).await {
                    warn!(
                        pod_id = %self.config.id,
                        container_id = %self.containers[i].config.id,
                        error = %e,
                        "Container stop failed during pod stop"
                    );
                }
            }
        }

        if let Err(e) = self
            .agent
            .stop_pod(self.proxy.as_mut(), &self.config)
            .await
        {
            warn!(pod_id = %self.config.id, error = %e, "Guest sandbox teardown failed");
        }

        self.proxy.unregister(self.state.proxy_pid).await?;
        self.state.url.clear();
        self.state.proxy_pid = 0;

        self.hypervisor.stop_pod().await?;

        self.network.remove(&mut self.netns).await?;
        self.store.store_network(&self.config.id, &self.netns)?;

        let hook_state = self.hook_state("stopped");
        hooks::run_hooks(&self.config.hooks.post_stop, &hook_state, None, false).await?;

        self.state.state = RunState::Stopped;
        self.persist_pod_state()?;
        info!(pod_id = %self.config.id, "Pod stopped");
        Ok(())
    }

    async fn stop_container_in_guest(&mut self, index: usize) -> Result<()> {
        let container_id = self.containers[index].config.id.clone();
        // A container that never started has nothing in the guest.
        if matches!(
            self.containers[index].state.state,
            RunState::Running | RunState::Paused
        ) {
            self.agent
                .stop_container(self.proxy.as_mut(), &container_id)
                .await?;
        }

        let pid = self.containers[index].process.pid;
        self.shim.stop(pid)?;
        self.shim.wait(pid).await?;

        Self::teardown_container_share(&mut self.containers[index]);

        let container = &mut self.containers[index];
        container.state.state = RunState::Stopped;
        container.process.pid = 0;
        self.persist_container(index)
    }

    /// Pause the VM and mark the pod and every container paused in
    /// one persisted step.
    pub async fn pause(&mut self) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        check_pod_transition(self.state.state, RunState::Paused)?;

        self.hypervisor.pause_pod().await?;

        self.state.state = RunState::Paused;
        self.persist_pod_state()?;
        for i in 0..self.containers.len() {
            self.containers[i].state.state = RunState::Paused;
            self.persist_container(i)?;
        }
        info!(pod_id = %self.config.id, "Pod paused");
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        if self.state.state != RunState::Paused {
            return Err(Error::InvalidTransition {
                from: self.state.state,
                to: RunState::Running,
            });
        }

        self.hypervisor.resume_pod().await?;

        self.state.state = RunState::Running;
        self.persist_pod_state()?;
        for i in 0..self.containers.len() {
            self.containers[i].state.state = RunState::Running;
            self.persist_container(i)?;
        }
        info!(pod_id = %self.config.id, "Pod resumed");
        Ok(())
    }

    /// Delete the pod's persistent resources. Running pods are never
    /// destroyed.
    pub async fn delete(&mut self) -> Result<()> {
        {
            let _lock = self.store.rwlock_pod(&self.config.id)?;
            self.state = self.store.fetch_pod_state(&self.config.id)?;
            if !matches!(
                self.state.state,
                RunState::Ready | RunState::Paused | RunState::Stopped
            ) {
                return Err(Error::InvalidConfig(format!(
                    "pod {} is running, stop it before deleting",
                    self.config.id
                )));
            }

            // A paused pod still has a VM and proxy; reclaim them.
            if self.state.state == RunState::Paused {
                if let Err(e) = self.proxy.unregister(self.state.proxy_pid).await {
                    warn!(pod_id = %self.config.id, error = %e, "Proxy unregister failed");
                }
                if let Err(e) = self.hypervisor.stop_pod().await {
                    warn!(pod_id = %self.config.id, error = %e, "Hypervisor stop failed");
                }
            }
            // Any netns left behind (aborted start included) goes now.
            if !self.netns.path.as_os_str().is_empty()
                && let Err(e) = self.network.remove(&mut self.netns).await
            {
                warn!(pod_id = %self.config.id, error = %e, "Network teardown failed");
            }

            for container in &mut self.containers {
                Self::teardown_container_share(container);
            }
        }
        // The lock file lives inside the tree being removed; it is
        // released before deletion.
        self.store.delete_pod_resources(&self.config.id)?;
        info!(pod_id = %self.config.id, "Pod deleted");
        Ok(())
    }

    /// Create one container in an existing pod.
    pub async fn create_container(&mut self, config: ContainerConfig) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        config.validate()?;
        if self.container_index(&config.id).is_ok() {
            return Err(Error::AlreadyExists(format!("container {}", config.id)));
        }

        let block_index_snapshot = self.state.block_index;
        match self.create_container_locked(config.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Return any block slots reserved along the way
                // before surfacing the failure.
                self.state.block_index = block_index_snapshot;
                let _ = self.persist_pod_state();
                let _ = self
                    .store
                    .delete_container_resources(&self.config.id, &config.id);
                Err(e)
            }
        }
    }

    async fn create_container_locked(&mut self, config: ContainerConfig) -> Result<()> {
        self.store.store_container_config(&self.config.id, &config)?;
        let container = Self::build_container(
            &self.store,
            self.hypervisor.as_mut(),
            &self.config,
            &mut self.state,
            config,
        )
        .await?;
        let index = self.containers.len();
        self.containers.push(container);
        self.persist_pod_state()?;

        // In a running pod the guest learns about the container now;
        // otherwise that happens at pod start.
        if self.state.state == RunState::Running {
            let token = self
                .proxy
                .connect(&self.config.id, &self.state.url, true)
                .await?
                .ok_or_else(|| Error::ProxyFailure("no token minted".into()))?;
            self.containers[index].process = Process {
                token,
                pid: 0,
                start_time: now(),
            };

            let (storages, guest_mounts) = Self::setup_container_share(
                self.agent.as_ref(),
                &self.config,
                &mut self.containers[index],
            )?;
            let container = &self.containers[index];
            self.agent
                .create_container(
                    self.proxy.as_mut(),
                    &container.config,
                    storages,
                    &guest_mounts,
                )
                .await?;
        }

        self.persist_container(index)?;
        info!(pod_id = %self.config.id, container_id = %self.containers[index].config.id, "Container created");
        Ok(())
    }

    pub async fn start_container(&mut self, container_id: &str) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        let index = self.container_index(container_id)?;
        self.containers[index].state = self
            .store
            .fetch_container_state(&self.config.id, container_id)?;

        if self.state.state != RunState::Running {
            return Err(Error::InvalidTransition {
                from: self.state.state,
                to: RunState::Running,
            });
        }
        check_container_transition(self.containers[index].state.state, RunState::Running)?;

        self.agent
            .start_container(self.proxy.as_mut(), container_id)
            .await?;

        let container = &self.containers[index];
        let shim_pid = self
            .shim
            .start(&ShimParams {
                container_id: container.config.id.clone(),
                token: container.process.token.clone(),
                url: self.state.url.clone(),
                console: container.config.cmd.console.clone(),
                detach: container.config.cmd.detach,
            })
            .await?;

        let container = &mut self.containers[index];
        container.process.pid = shim_pid;
        container.process.start_time = now();
        container.state.state = RunState::Running;
        self.persist_container(index)?;
        info!(pod_id = %self.config.id, container_id, "Container started");
        Ok(())
    }

    pub async fn stop_container(&mut self, container_id: &str) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        let index = self.container_index(container_id)?;
        self.containers[index].state = self
            .store
            .fetch_container_state(&self.config.id, container_id)?;
        check_container_transition(self.containers[index].state.state, RunState::Stopped)?;

        self.stop_container_in_guest(index).await?;
        info!(pod_id = %self.config.id, container_id, "Container stopped");
        Ok(())
    }

    pub async fn delete_container(&mut self, container_id: &str) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        let index = self.container_index(container_id)?;
        let state = self
            .store
            .fetch_container_state(&self.config.id, container_id)?;
        if !matches!(state.state, RunState::Ready | RunState::Stopped) {
            return Err(Error::InvalidTransition {
                from: state.state,
                to: RunState::Stopped,
            });
        }

        // Give back hotplugged devices and the rootfs block slot.
        for device in self.containers[index].devices.clone() {
            if let Err(e) =
                device::detach_device(&device, self.hypervisor.as_mut(), &mut self.state).await
            {
                warn!(container_id, error = %e, "Device detach failed");
            }
        }
        if !self.containers[index].state.fstype.is_empty() {
            let drive = Drive {
                path: self.containers[index].config.rootfs.clone(),
                index: self.containers[index].state.block_index,
                readonly: false,
            };
            if let Err(e) = self
                .hypervisor
                .remove_device(DeviceData::Block(drive))
                .await
            {
                warn!(container_id, error = %e, "Rootfs drive removal failed");
            }
            self.state.block_index = self.state.block_index.saturating_sub(1);
        }
        self.persist_pod_state()?;

        Self::teardown_container_share(&mut self.containers[index]);
        self.store
            .delete_container_resources(&self.config.id, container_id)?;
        self.containers.remove(index);
        info!(pod_id = %self.config.id, container_id, "Container deleted");
        Ok(())
    }

    /// Run an additional process in a running container. Returns the
    /// persisted process record for the new exec session.
    pub async fn enter_container(
        &mut self,
        container_id: &str,
        cmd: &vpod_shared::config::Cmd,
    ) -> Result<Process> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        let index = self.container_index(container_id)?;

        if self.state.state != RunState::Running
            || self.containers[index].state.state != RunState::Running
        {
            return Err(Error::InvalidTransition {
                from: self.containers[index].state.state,
                to: RunState::Running,
            });
        }

        let token = self
            .proxy
            .connect(&self.config.id, &self.state.url, true)
            .await?
            .ok_or_else(|| Error::ProxyFailure("no token minted".into()))?;

        self.agent
            .exec_process(self.proxy.as_mut(), container_id, &token, cmd)
            .await?;

        let shim_pid = self
            .shim
            .start(&ShimParams {
                container_id: container_id.to_string(),
                token: token.clone(),
                url: self.state.url.clone(),
                console: cmd.console.clone(),
                detach: cmd.detach,
            })
            .await?;

        let process = Process {
            token,
            pid: shim_pid,
            start_time: now(),
        };
        self.containers[index].process = process.clone();
        self.persist_container(index)?;
        Ok(process)
    }

    /// Signal the container's root process, or every process in it.
    pub async fn kill_container(
        &mut self,
        container_id: &str,
        signal: i32,
        all: bool,
    ) -> Result<()> {
        let _lock = self.store.rwlock_pod(&self.config.id)?;
        self.state = self.store.fetch_pod_state(&self.config.id)?;
        let index = self.container_index(container_id)?;
        let token = self.containers[index].process.token.clone();

        self.agent
            .signal_process(self.proxy.as_mut(), container_id, &token, signal, all)
            .await
    }
}

fn is_block_device(path: &Path) -> bool {
    match nix::sys::stat::stat(path) {
        Ok(st) => (st.st_mode & nix::libc::S_IFMT) == nix::libc::S_IFBLK,
        Err(_) => false,
    }
}
