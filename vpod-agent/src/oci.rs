//! OCI runtime documents and the host→guest spec transform.
//!
//! Only the fields the guest supervisor consumes are modeled; the
//! outer runtime owns full OCI parsing. The transform rewrites a
//! host-side spec into the shape the guest expects: host-only
//! concerns dropped, paths moved to their guest-side locations.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use vpod_shared::Result;
use vpod_shared::config::{Cmd, ContainerConfig};
use vpod_shared::user::{parse_group, parse_user};

pub const SHM_MOUNT_POINT: &str = "/dev/shm";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciProcess {
    #[serde(default)]
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub mount_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciHook {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciHooks {
    #[serde(default)]
    pub prestart: Vec<OciHook>,
    #[serde(default)]
    pub poststart: Vec<OciHook>,
    #[serde(default)]
    pub poststop: Vec<OciHook>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciLinux {
    #[serde(default)]
    pub namespaces: Vec<OciNamespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OciSpec {
    #[serde(default)]
    pub hostname: String,
    pub process: OciProcess,
    pub root: OciRoot,
    #[serde(default)]
    pub mounts: Vec<OciMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<OciHooks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<OciLinux>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Build the guest process description from a container command.
///
/// `primary_group` overrides the gid derived from `user`;
/// supplementary groups are appended as additional gids.
pub fn process_from_cmd(cmd: &Cmd) -> Result<OciProcess> {
    let (uid, gid) = if cmd.user.is_empty() {
        (0, None)
    } else {
        parse_user(&cmd.user)?
    };
    let gid = if cmd.primary_group.is_empty() {
        gid.unwrap_or(0)
    } else {
        parse_group(&cmd.primary_group)?
    };
    let additional_gids = cmd
        .supplementary_groups
        .iter()
        .map(|g| parse_group(g))
        .collect::<Result<Vec<u32>>>()?;

    Ok(OciProcess {
        terminal: cmd.interactive,
        user: OciUser {
            uid,
            gid,
            additional_gids,
        },
        args: cmd.args.clone(),
        env: cmd
            .envs
            .iter()
            .map(|e| format!("{}={}", e.var, e.value))
            .collect(),
        cwd: cmd.workdir.clone(),
    })
}

/// Build a guest-ready spec for a container.
pub fn spec_from_config(
    config: &ContainerConfig,
    hostname: &str,
    guest_rootfs: &str,
    guest_mounts: &HashMap<String, String>,
) -> Result<OciSpec> {
    let mut spec = OciSpec {
        hostname: hostname.to_string(),
        process: process_from_cmd(&config.cmd)?,
        root: OciRoot {
            path: config.rootfs.display().to_string(),
            readonly: false,
        },
        mounts: config
            .mounts
            .iter()
            .map(|m| OciMount {
                destination: m.destination.display().to_string(),
                mount_type: m.fstype.clone(),
                source: m.source.display().to_string(),
                options: m.options.clone(),
            })
            .collect(),
        hooks: None,
        linux: Some(OciLinux::default()),
        annotations: config.annotations.clone(),
    };
    transform_spec(&mut spec, guest_rootfs, guest_mounts);
    Ok(spec)
}

/// Rewrite a host-side OCI spec for consumption inside the guest.
pub fn transform_spec(
    spec: &mut OciSpec,
    guest_rootfs: &str,
    guest_mounts: &HashMap<String, String>,
) {
    // Host-level hooks have already run on the host.
    spec.hooks = None;

    if let Some(linux) = &mut spec.linux {
        // The guest kernel has no seccomp support for containers.
        linux.seccomp = None;
        // Networking is prepared on the host and handed to the VM.
        linux.namespaces.retain(|ns| ns.ns_type != "network");
    }

    for mount in &mut spec.mounts {
        if mount.destination == SHM_MOUNT_POINT {
            mount.mount_type = "tmpfs".to_string();
            mount.source = "shm".to_string();
            mount.options = vec![
                "noexec".into(),
                "nosuid".into(),
                "nodev".into(),
                "mode=1777".into(),
                "size=65536k".into(),
            ];
            continue;
        }
        if let Some(guest_source) = guest_mounts.get(&mount.destination) {
            mount.source = guest_source.clone();
        }
    }

    spec.root.path = guest_rootfs.to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use vpod_shared::config::EnvVar;

    #[test]
    fn test_process_from_cmd_user_parsing() {
        let cmd = Cmd {
            args: vec!["/bin/sh".into()],
            user: "1000:100".into(),
            ..Default::default()
        };
        let process = process_from_cmd(&cmd).unwrap();
        assert_eq!(process.user.uid, 1000);
        assert_eq!(process.user.gid, 100);

        // primary_group wins over the user-derived gid.
        let cmd = Cmd {
            args: vec!["/bin/sh".into()],
            user: "1000:100".into(),
            primary_group: "27".into(),
            supplementary_groups: vec!["4".into(), "11".into()],
            ..Default::default()
        };
        let process = process_from_cmd(&cmd).unwrap();
        assert_eq!(process.user.gid, 27);
        assert_eq!(process.user.additional_gids, vec![4, 11]);
    }

    #[test]
    fn test_process_env_formatting() {
        let cmd = Cmd {
            args: vec!["env".into()],
            envs: vec![EnvVar {
                var: "PATH".into(),
                value: "/usr/bin".into(),
            }],
            ..Default::default()
        };
        let process = process_from_cmd(&cmd).unwrap();
        assert_eq!(process.env, vec!["PATH=/usr/bin"]);
    }

    #[test]
    fn test_transform_drops_host_concerns() {
        let mut spec = OciSpec {
            hooks: Some(OciHooks::default()),
            linux: Some(OciLinux {
                namespaces: vec![
                    OciNamespace {
                        ns_type: "network".into(),
                        path: "/run/netns/x".into(),
                    },
                    OciNamespace {
                        ns_type: "pid".into(),
                        path: String::new(),
                    },
                ],
                seccomp: Some(serde_json::json!({"defaultAction": "SCMP_ACT_ERRNO"})),
            }),
            ..Default::default()
        };
        transform_spec(&mut spec, "/guest/rootfs", &HashMap::new());

        assert!(spec.hooks.is_none());
        let linux = spec.linux.as_ref().unwrap();
        assert!(linux.seccomp.is_none());
        assert_eq!(linux.namespaces.len(), 1);
        assert_eq!(linux.namespaces[0].ns_type, "pid");
        assert_eq!(spec.root.path, "/guest/rootfs");
    }

    #[test]
    fn test_transform_rewrites_shm_mount() {
        let mut spec = OciSpec {
            mounts: vec![OciMount {
                destination: "/dev/shm".into(),
                mount_type: "bind".into(),
                source: "/run/shm".into(),
                options: vec!["rbind".into()],
            }],
            ..Default::default()
        };
        transform_spec(&mut spec, "/guest/rootfs", &HashMap::new());

        let shm = &spec.mounts[0];
        assert_eq!(shm.mount_type, "tmpfs");
        assert_eq!(shm.source, "shm");
        assert!(shm.options.contains(&"mode=1777".to_string()));
        assert!(shm.options.contains(&"size=65536k".to_string()));
    }

    #[test]
    fn test_transform_rewrites_bind_mount_sources() {
        let mut guest_mounts = HashMap::new();
        guest_mounts.insert(
            "/data".to_string(),
            "/run/shared/c1/mounts/0".to_string(),
        );
        let mut spec = OciSpec {
            mounts: vec![
                OciMount {
                    destination: "/data".into(),
                    mount_type: "bind".into(),
                    source: "/host/data".into(),
                    options: vec![],
                },
                OciMount {
                    destination: "/proc".into(),
                    mount_type: "proc".into(),
                    source: "proc".into(),
                    options: vec![],
                },
            ],
            ..Default::default()
        };
        transform_spec(&mut spec, "/guest/rootfs", &guest_mounts);

        assert_eq!(spec.mounts[0].source, "/run/shared/c1/mounts/0");
        assert_eq!(spec.mounts[1].source, "proc");
    }
}
