//! Public library API.
//!
//! Thin, stateless entry points: every call locates the pod on disk,
//! reconstructs it, performs one locked operation, and reports the
//! resulting status. Status calls take the shared lock and never
//! contend with one another.

use std::collections::HashMap;

use vpod_shared::Result;
use vpod_shared::config::{Cmd, ContainerConfig, HypervisorType, PodConfig, StorageRoots};
use vpod_shared::state::{ContainerState, PodState, Process};

use crate::pod::Pod;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStatus {
    pub id: String,
    pub state: ContainerState,
    pub process: Process,
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodStatus {
    pub id: String,
    pub state: PodState,
    pub hypervisor_type: HypervisorType,
    pub containers: Vec<ContainerStatus>,
    pub annotations: HashMap<String, String>,
}

fn pod_status_locked(store: &Store, pod_id: &str) -> Result<PodStatus> {
    let config = store.fetch_pod_config(pod_id)?;
    let state = store.fetch_pod_state(pod_id)?;

    let mut containers = Vec::new();
    for container_id in store.list_containers(pod_id)? {
        containers.push(container_status_locked(store, pod_id, &container_id)?);
    }

    Ok(PodStatus {
        id: pod_id.to_string(),
        state,
        hypervisor_type: config.hypervisor_type,
        containers,
        annotations: config.annotations,
    })
}

fn container_status_locked(
    store: &Store,
    pod_id: &str,
    container_id: &str,
) -> Result<ContainerStatus> {
    let config = store.fetch_container_config(pod_id, container_id)?;
    let state = store.fetch_container_state(pod_id, container_id)?;
    let process = store.fetch_process(pod_id, container_id).unwrap_or_default();
    Ok(ContainerStatus {
        id: container_id.to_string(),
        state,
        process,
        annotations: config.annotations,
    })
}

pub async fn create_pod(config: PodConfig) -> Result<PodStatus> {
    let pod = Pod::create(config).await?;
    status_pod(&pod.config.storage_roots, pod.id()).await
}

pub async fn delete_pod(roots: &StorageRoots, pod_id: &str) -> Result<()> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.delete().await
}

pub async fn start_pod(roots: &StorageRoots, pod_id: &str) -> Result<PodStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.start().await?;
    status_pod(roots, pod_id).await
}

pub async fn stop_pod(roots: &StorageRoots, pod_id: &str) -> Result<PodStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.stop().await?;
    status_pod(roots, pod_id).await
}

/// Create and immediately start a pod.
pub async fn run_pod(config: PodConfig) -> Result<PodStatus> {
    let pod = Pod::create(config).await?;
    let roots = pod.config.storage_roots.clone();
    let pod_id = pod.id().to_string();
    drop(pod);
    start_pod(&roots, &pod_id).await
}

pub async fn pause_pod(roots: &StorageRoots, pod_id: &str) -> Result<PodStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.pause().await?;
    status_pod(roots, pod_id).await
}

pub async fn resume_pod(roots: &StorageRoots, pod_id: &str) -> Result<PodStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.resume().await?;
    status_pod(roots, pod_id).await
}

pub async fn list_pod(roots: &StorageRoots) -> Result<Vec<PodStatus>> {
    let store = Store::new(roots);
    let mut statuses = Vec::new();
    for pod_id in store.list_pods()? {
        let _lock = store.rlock_pod(&pod_id)?;
        statuses.push(pod_status_locked(&store, &pod_id)?);
    }
    Ok(statuses)
}

pub async fn status_pod(roots: &StorageRoots, pod_id: &str) -> Result<PodStatus> {
    let store = Store::new(roots);
    let _lock = store.rlock_pod(pod_id)?;
    pod_status_locked(&store, pod_id)
}

pub async fn create_container(
    roots: &StorageRoots,
    pod_id: &str,
    config: ContainerConfig,
) -> Result<ContainerStatus> {
    let container_id = config.id.clone();
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.create_container(config).await?;
    status_container(roots, pod_id, &container_id).await
}

pub async fn delete_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
) -> Result<()> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.delete_container(container_id).await
}

pub async fn start_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
) -> Result<ContainerStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.start_container(container_id).await?;
    status_container(roots, pod_id, container_id).await
}

pub async fn stop_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
) -> Result<ContainerStatus> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.stop_container(container_id).await?;
    status_container(roots, pod_id, container_id).await
}

/// Run an extra process inside a running container.
pub async fn enter_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
    cmd: Cmd,
) -> Result<Process> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.enter_container(container_id, &cmd).await
}

pub async fn status_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
) -> Result<ContainerStatus> {
    let store = Store::new(roots);
    let _lock = store.rlock_pod(pod_id)?;
    container_status_locked(&store, pod_id, container_id)
}

/// Send a signal to the container's root process, or to all of its
/// processes when `all` is set.
pub async fn kill_container(
    roots: &StorageRoots,
    pod_id: &str,
    container_id: &str,
    signal: i32,
    all: bool,
) -> Result<()> {
    let mut pod = Pod::fetch(roots, pod_id).await?;
    pod.kill_container(container_id, signal, all).await
}
