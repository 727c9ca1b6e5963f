//! Pod and container configuration.
//!
//! Everything here is immutable once the pod is created and is
//! persisted verbatim under the config root. Subsystem selection uses
//! typed sums with explicit validators instead of stringly-typed maps.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceSpec;
use crate::error::{Error, Result};
use crate::volumes::{Sockets, Volumes};

pub const DEFAULT_VCPUS: u32 = 1;
pub const DEFAULT_MEM_MIB: u32 = 2048;

const DEFAULT_CONFIG_ROOT: &str = "/var/lib/vpod";
const DEFAULT_RUN_ROOT: &str = "/run/vpod";

/// On-disk roots for the persistent store.
///
/// The config root survives reboots; the run root is ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRoots {
    pub config_root: PathBuf,
    pub run_root: PathBuf,
}

impl Default for StorageRoots {
    fn default() -> Self {
        Self {
            config_root: PathBuf::from(DEFAULT_CONFIG_ROOT),
            run_root: PathBuf::from(DEFAULT_RUN_ROOT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HypervisorType {
    #[default]
    CloudHypervisor,
    Mock,
}

/// A single kernel command line parameter.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: String,
}

impl Param {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// Guest kernel image. Required.
    pub kernel_path: PathBuf,
    /// Guest rootfs image. Required.
    pub image_path: PathBuf,
    /// Hypervisor binary. Empty means the adapter's builtin default.
    #[serde(default)]
    pub hypervisor_path: PathBuf,
    /// User-supplied kernel parameters, appended after the adapter's
    /// base and debug sets.
    #[serde(default)]
    pub kernel_params: Vec<Param>,
    #[serde(default)]
    pub default_vcpus: u32,
    #[serde(default)]
    pub default_mem_mib: u32,
    #[serde(default)]
    pub debug: bool,
}

impl HypervisorConfig {
    /// Check required paths and fill in resource defaults.
    pub fn validate(&mut self) -> Result<()> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("kernel path missing".into()));
        }
        if self.image_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("image path missing".into()));
        }
        if self.default_vcpus == 0 {
            self.default_vcpus = DEFAULT_VCPUS;
        }
        if self.default_mem_mib == 0 {
            self.default_mem_mib = DEFAULT_MEM_MIB;
        }
        Ok(())
    }
}

/// Agent selection and configuration as one typed sum.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentConfig {
    #[default]
    Noop,
    Hyper {
        /// Guest channel sockets (ctl and tty), in
        /// `devID:id:hostPath:name` form.
        sockets: Sockets,
        /// Extra host paths shared into the guest over 9p.
        #[serde(default)]
        shared_paths: Vec<PathBuf>,
    },
    Kata {
        grpc_socket: String,
    },
    Sshd {
        username: String,
        server: String,
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyType {
    #[default]
    Noop,
    CcProxy,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy binary. Required for cc-proxy.
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShimType {
    #[default]
    Noop,
    CcShim,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShimConfig {
    #[serde(default)]
    pub path: PathBuf,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkModel {
    #[default]
    Noop,
    /// Enter an existing netns and materialize endpoints from the
    /// live kernel state.
    Default,
    /// Run a plugin per endpoint, then rescan to reconcile.
    Plugin,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Existing netns to use. Empty means the engine creates one and
    /// owns its deletion.
    #[serde(default)]
    pub netns_path: PathBuf,
    /// Override for the guest-visible interface name of endpoint 0.
    #[serde(default)]
    pub interface_name: String,
    /// Plugin binary, for the plugin model.
    #[serde(default)]
    pub plugin_path: PathBuf,
    /// Plugin configuration directory, passed through untouched.
    #[serde(default)]
    pub plugin_conf_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: u32,
    pub mem_mib: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpus: DEFAULT_VCPUS,
            mem_mib: DEFAULT_MEM_MIB,
        }
    }
}

/// One lifecycle hook: an external binary fed an OCI State document
/// on stdin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hook {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    /// Seconds before the hook is killed. 0 means no timeout.
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub pre_start: Vec<Hook>,
    #[serde(default)]
    pub post_start: Vec<Hook>,
    #[serde(default)]
    pub post_stop: Vec<Hook>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvVar {
    pub var: String,
    pub value: String,
}

/// Command run inside a container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cmd {
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<EnvVar>,
    #[serde(default)]
    pub workdir: String,
    /// `uid` or `uid:gid`.
    #[serde(default)]
    pub user: String,
    /// Overrides the gid derived from `user` when set.
    #[serde(default)]
    pub primary_group: String,
    #[serde(default)]
    pub supplementary_groups: Vec<String>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub console: String,
    #[serde(default)]
    pub detach: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub id: String,
    /// Host path of the container root filesystem.
    pub rootfs: PathBuf,
    pub cmd: Cmd,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::MissingId);
        }
        if self.rootfs.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(format!(
                "container {} has no rootfs",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodConfig {
    /// Synthesized at validation time when absent.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub hypervisor_type: HypervisorType,
    pub hypervisor_config: HypervisorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub proxy_config: ProxyConfig,
    #[serde(default)]
    pub shim_type: ShimType,
    #[serde(default)]
    pub shim_config: ShimConfig,
    #[serde(default)]
    pub network_model: NetworkModel,
    #[serde(default)]
    pub network_config: NetworkConfig,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub hooks: Hooks,
    /// Host paths shared into the guest, keyed by mount tag.
    #[serde(default)]
    pub volumes: Volumes,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub storage_roots: StorageRoots,
}

impl PodConfig {
    /// Validate the pod configuration, synthesizing an id when the
    /// caller supplied none and filling in resource defaults.
    pub fn validate(&mut self) -> Result<()> {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.hypervisor_config.validate()?;
        if self.resources.vcpus == 0 {
            self.resources.vcpus = self.hypervisor_config.default_vcpus;
        }
        if self.resources.mem_mib == 0 {
            self.resources.mem_mib = self.hypervisor_config.default_mem_mib;
        }
        let mut seen = std::collections::HashSet::new();
        for container in &self.containers {
            container.validate()?;
            if !seen.insert(container.id.as_str()) {
                return Err(Error::AlreadyExists(format!(
                    "container {}",
                    container.id
                )));
            }
        }
        Ok(())
    }

    pub fn container(&self, id: &str) -> Option<&ContainerConfig> {
        self.containers.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_hypervisor_config() -> HypervisorConfig {
        HypervisorConfig {
            kernel_path: PathBuf::from("/usr/share/vpod/vmlinuz"),
            image_path: PathBuf::from("/usr/share/vpod/image.img"),
            ..Default::default()
        }
    }

    #[test]
    fn test_hypervisor_config_requires_paths() {
        let mut config = HypervisorConfig::default();
        assert!(config.validate().is_err());

        config.kernel_path = PathBuf::from("/boot/vmlinuz");
        assert!(config.validate().is_err());

        config.image_path = PathBuf::from("/img.img");
        config.validate().unwrap();
        assert_eq!(config.default_vcpus, DEFAULT_VCPUS);
        assert_eq!(config.default_mem_mib, DEFAULT_MEM_MIB);
    }

    #[test]
    fn test_pod_config_synthesizes_id() {
        let mut config = PodConfig {
            hypervisor_config: valid_hypervisor_config(),
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(!config.id.is_empty());

        // A caller-provided id is preserved.
        let mut config = PodConfig {
            id: "pod-1".into(),
            hypervisor_config: valid_hypervisor_config(),
            ..Default::default()
        };
        config.validate().unwrap();
        assert_eq!(config.id, "pod-1");
    }

    #[test]
    fn test_duplicate_container_ids_rejected() {
        let container = ContainerConfig {
            id: "c1".into(),
            rootfs: PathBuf::from("/tmp/rootfs"),
            ..Default::default()
        };
        let mut config = PodConfig {
            hypervisor_config: valid_hypervisor_config(),
            containers: vec![container.clone(), container],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_agent_config_tagged_serialization() {
        let config = AgentConfig::Kata {
            grpc_socket: "/run/kata.sock".into(),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""type":"kata""#));
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
