//! Device descriptions shared between the configuration, the device
//! manager, and the persistent store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A device requested by a container configuration.
///
/// Either `host_path` or the `major`/`minor` pair identifies the host
/// device; the manager resolves the path from sysfs when only the
/// numbers are known.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(default)]
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    /// One of `c`, `b`, `u`, `p`.
    #[serde(default)]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(default)]
    pub file_mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

/// Resolved device data carried by every device variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    #[serde(default)]
    pub dev_type: String,
    #[serde(default)]
    pub major: i64,
    #[serde(default)]
    pub minor: i64,
    #[serde(default)]
    pub file_mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl DeviceInfo {
    pub fn from_spec(spec: &DeviceSpec, resolved_host_path: PathBuf) -> Self {
        Self {
            host_path: resolved_host_path,
            container_path: spec.container_path.clone(),
            dev_type: spec.dev_type.clone(),
            major: spec.major,
            minor: spec.minor,
            file_mode: spec.file_mode,
            uid: spec.uid,
            gid: spec.gid,
        }
    }
}
