//! vpod-core: pod orchestration over lightweight VMs.
//!
//! Binds the pluggable subsystems (hypervisor, agent, proxy, shim,
//! network) into the pod and container lifecycles, backed by a
//! lock-serialized on-disk store. The public surface is [`api`].

pub mod api;
pub mod device;
pub mod factory;
pub mod hooks;
pub mod logging;
pub mod mount;
pub mod pod;
pub mod store;

pub use api::{
    ContainerStatus, PodStatus, create_container, create_pod, delete_container, delete_pod,
    enter_container, kill_container, list_pod, pause_pod, resume_pod, run_pod, start_container,
    start_pod, status_container, status_pod, stop_container, stop_pod,
};
pub use pod::{Container, Pod};
pub use store::Store;

// Re-export the shared data model so embedders need one import.
pub use vpod_shared::config;
pub use vpod_shared::state;
pub use vpod_shared::{Error, Result};
