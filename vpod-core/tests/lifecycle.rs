//! Pod and container lifecycle integration tests.
//!
//! Everything here runs against the mock hypervisor and in-process
//! proxy/shim, so no VM, privileges, or external binaries are needed.
//! Scratch storage roots come from tempdirs and are asserted empty
//! after a full lifecycle.

use std::path::PathBuf;

use tempfile::TempDir;

use vpod_core::api;
use vpod_core::config::{
    AgentConfig, Cmd, ContainerConfig, HypervisorConfig, HypervisorType, PodConfig, StorageRoots,
};
use vpod_core::state::RunState;
use vpod_core::{Error, Store};
use vpod_shared::device::DeviceSpec;

fn roots(dir: &TempDir) -> StorageRoots {
    StorageRoots {
        config_root: dir.path().join("config"),
        run_root: dir.path().join("run"),
    }
}

fn pod_config(dir: &TempDir, id: &str, agent: AgentConfig) -> PodConfig {
    PodConfig {
        id: id.into(),
        hypervisor_type: HypervisorType::Mock,
        hypervisor_config: HypervisorConfig {
            kernel_path: PathBuf::from("/usr/share/vpod/vmlinuz"),
            image_path: PathBuf::from("/usr/share/vpod/image.img"),
            ..Default::default()
        },
        agent,
        storage_roots: roots(dir),
        ..Default::default()
    }
}

fn container_config(id: &str, rootfs: PathBuf) -> ContainerConfig {
    ContainerConfig {
        id: id.into(),
        rootfs,
        cmd: Cmd {
            args: vec!["/bin/sh".into()],
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_pod_persists_configs_and_ready_state() {
    // Scenario: one pod, one container, noop agent, mock hypervisor.
    let dir = TempDir::new().unwrap();
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];

    let status = api::create_pod(config).await.unwrap();
    assert_eq!(status.state.state, RunState::Ready);
    assert_eq!(status.containers.len(), 1);
    assert_eq!(status.containers[0].state.state, RunState::Ready);

    let r = roots(&dir);
    assert!(r.config_root.join("P1/config.json").exists());
    assert!(r.config_root.join("P1/C1/config.json").exists());

    let raw = std::fs::read_to_string(r.run_root.join("P1/state.json")).unwrap();
    assert!(raw.contains("ready"));
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["state"], "ready");
}

#[tokio::test]
async fn test_start_stop_start_traversal() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];
    api::create_pod(config).await.unwrap();

    let status = api::start_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Running);
    assert_eq!(status.containers[0].state.state, RunState::Running);

    let status = api::stop_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Stopped);
    assert_eq!(status.containers[0].state.state, RunState::Stopped);

    let status = api::start_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Running);

    // Back to stopped, then verify the graph rejects leaving it in
    // any direction other than a restart.
    api::stop_pod(&r, "P1").await.unwrap();
    assert!(matches!(
        api::pause_pod(&r, "P1").await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        api::resume_pod(&r, "P1").await,
        Err(Error::InvalidTransition { .. })
    ));

    // Failed transitions left the persisted state untouched.
    let status = api::status_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Stopped);
}

#[tokio::test]
async fn test_illegal_transitions_do_not_mutate_state() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();

    // Ready pods cannot pause or resume.
    assert!(matches!(
        api::pause_pod(&r, "P1").await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        api::resume_pod(&r, "P1").await,
        Err(Error::InvalidTransition { .. })
    ));
    let status = api::status_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Ready);

    // Running pods cannot start again.
    api::start_pod(&r, "P1").await.unwrap();
    assert!(matches!(
        api::start_pod(&r, "P1").await,
        Err(Error::InvalidTransition { .. })
    ));
    let status = api::status_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Running);
}

#[tokio::test]
async fn test_pause_resume_touches_all_containers() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![
        container_config("C1", dir.path().join("r1")),
        container_config("C2", dir.path().join("r2")),
    ];
    api::create_pod(config).await.unwrap();
    api::start_pod(&r, "P1").await.unwrap();

    let status = api::pause_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Paused);
    for container in &status.containers {
        assert_eq!(container.state.state, RunState::Paused);
    }

    let status = api::resume_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Running);
    for container in &status.containers {
        assert_eq!(container.state.state, RunState::Running);
    }
}

#[tokio::test]
async fn test_lifecycle_closure_leaves_no_files() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];

    api::create_pod(config).await.unwrap();
    api::start_pod(&r, "P1").await.unwrap();
    api::stop_pod(&r, "P1").await.unwrap();
    api::delete_pod(&r, "P1").await.unwrap();

    assert!(!r.config_root.join("P1").exists());
    assert!(!r.run_root.join("P1").exists());
    assert!(api::list_pod(&r).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_ready_pod_is_idempotent_state_change() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();

    let status = api::stop_pod(&r, "P1").await.unwrap();
    assert_eq!(status.state.state, RunState::Stopped);
    api::delete_pod(&r, "P1").await.unwrap();
}

#[tokio::test]
async fn test_delete_refuses_running_pod() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();
    api::start_pod(&r, "P1").await.unwrap();

    assert!(api::delete_pod(&r, "P1").await.is_err());
    assert!(r.config_root.join("P1").exists());

    api::stop_pod(&r, "P1").await.unwrap();
    api::delete_pod(&r, "P1").await.unwrap();
}

#[tokio::test]
async fn test_hyper_agent_full_container_lifecycle() {
    // Scenario: hyperstart-like agent, mock hypervisor, container
    // created and started after the pod is already running.
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let config = pod_config(
        &dir,
        "P1",
        AgentConfig::Hyper {
            sockets: Default::default(),
            shared_paths: Vec::new(),
        },
    );
    api::create_pod(config).await.unwrap();
    api::start_pod(&r, "P1").await.unwrap();

    // The rootfs already sits at its shared location, so no bind
    // mount is required to start it.
    let rootfs = r.run_root.join("P1/shared/100/rootfs");
    std::fs::create_dir_all(&rootfs).unwrap();

    let status = api::create_container(&r, "P1", container_config("100", rootfs))
        .await
        .unwrap();
    assert_eq!(status.state.state, RunState::Ready);
    assert!(!status.process.token.is_empty());

    let status = api::start_container(&r, "P1", "100").await.unwrap();
    assert_eq!(status.state.state, RunState::Running);

    let status = api::stop_container(&r, "P1", "100").await.unwrap();
    assert_eq!(status.state.state, RunState::Stopped);

    api::stop_pod(&r, "P1").await.unwrap();
    api::delete_pod(&r, "P1").await.unwrap();

    assert!(!r.config_root.join("P1").exists());
    assert!(!r.run_root.join("P1").exists());
}

#[tokio::test]
async fn test_block_index_returns_to_zero() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();

    for cycle in 0..3 {
        let mut config = container_config("blk", dir.path().join("rootfs"));
        config.devices = vec![DeviceSpec {
            host_path: PathBuf::from("/dev/sdb"),
            container_path: PathBuf::from("/dev/sdb"),
            dev_type: "b".into(),
            ..Default::default()
        }];
        api::create_container(&r, "P1", config).await.unwrap();

        let status = api::status_pod(&r, "P1").await.unwrap();
        assert_eq!(status.state.block_index, 1, "cycle {cycle}");

        api::delete_container(&r, "P1", "blk").await.unwrap();
        let status = api::status_pod(&r, "P1").await.unwrap();
        assert_eq!(status.state.block_index, 0, "cycle {cycle}");
    }
}

#[tokio::test]
async fn test_kill_missing_container_is_not_found() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();
    api::start_pod(&r, "P1").await.unwrap();

    let before = api::status_pod(&r, "P1").await.unwrap();
    let err = api::kill_container(&r, "P1", "missing", 15, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let after = api::status_pod(&r, "P1").await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_enter_container_mints_new_token() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];
    api::create_pod(config).await.unwrap();
    api::start_pod(&r, "P1").await.unwrap();

    let root_token = api::status_container(&r, "P1", "C1")
        .await
        .unwrap()
        .process
        .token;

    let process = api::enter_container(
        &r,
        "P1",
        "C1",
        Cmd {
            args: vec!["/bin/ps".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(!process.token.is_empty());
    assert_ne!(process.token, root_token);
}

#[tokio::test]
async fn test_container_cannot_start_in_ready_pod() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];
    api::create_pod(config).await.unwrap();

    assert!(matches!(
        api::start_container(&r, "P1", "C1").await,
        Err(Error::InvalidTransition { .. })
    ));
    let status = api::status_container(&r, "P1", "C1").await.unwrap();
    assert_eq!(status.state.state, RunState::Ready);
}

#[tokio::test]
async fn test_duplicate_pod_rejected() {
    let dir = TempDir::new().unwrap();
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();
    let err = api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mutating_calls_serialize_on_the_pod_lock() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    api::create_pod(pod_config(&dir, "P1", AgentConfig::Noop))
        .await
        .unwrap();

    // Hold the exclusive lock the way any mutating operation would.
    let store = Store::new(&r);
    let guard = store.rwlock_pod("P1").unwrap();

    let r2 = r.clone();
    let start = tokio::spawn(async move { api::start_pod(&r2, "P1").await });

    // While the lock is held the start cannot make progress.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!start.is_finished());

    drop(guard);
    let status = start.await.unwrap().unwrap();
    assert_eq!(status.state.state, RunState::Running);
}

#[tokio::test]
async fn test_status_matches_disk_after_each_call() {
    let dir = TempDir::new().unwrap();
    let r = roots(&dir);
    let mut config = pod_config(&dir, "P1", AgentConfig::Noop);
    config.containers = vec![container_config("C1", dir.path().join("rootfs"))];
    api::create_pod(config).await.unwrap();

    for expected in [
        (api::start_pod(&r, "P1").await.unwrap(), RunState::Running),
        (api::pause_pod(&r, "P1").await.unwrap(), RunState::Paused),
        (api::resume_pod(&r, "P1").await.unwrap(), RunState::Running),
        (api::stop_pod(&r, "P1").await.unwrap(), RunState::Stopped),
    ] {
        let (returned, want) = expected;
        assert_eq!(returned.state.state, want);

        let raw = std::fs::read(r.run_root.join("P1/state.json")).unwrap();
        let on_disk: vpod_core::state::PodState = serde_json::from_slice(&raw).unwrap();
        assert_eq!(on_disk, returned.state);
    }
}
