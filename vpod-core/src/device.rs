//! Host device classification and hotplug.
//!
//! Devices are classified by host path into VFIO passthrough, block,
//! or generic. VFIO and block devices involve the hypervisor; generic
//! devices only exist as guest device nodes and need nothing from the
//! host.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vpod_shared::device::{DeviceInfo, DeviceSpec};
use vpod_shared::state::PodState;
use vpod_shared::{Error, Result};
use vpod_hypervisor::{DeviceData, Drive, Hypervisor};

const SYS_DEV_PREFIX: &str = "/sys/dev";
const SYS_IOMMU_GROUPS: &str = "/sys/kernel/iommu_groups";
const VFIO_PATH_PREFIX: &str = "/dev/vfio/";

/// Persisted as a `{type, data}` envelope; the tag set is part of the
/// on-disk format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Device {
    Vfio {
        /// Every device in the IOMMU group, by BDF. Filled at attach.
        #[serde(default)]
        bdfs: Vec<String>,
        info: DeviceInfo,
    },
    Block {
        /// Guest block device path for the reserved slot.
        #[serde(default)]
        virt_path: PathBuf,
        #[serde(default)]
        index: u32,
        info: DeviceInfo,
    },
    Generic {
        info: DeviceInfo,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Vfio,
    Block,
    Generic,
}

/// Classify a host device path by its prefix.
pub fn classify(host_path: &str) -> DeviceClass {
    if let Some(group) = host_path.strip_prefix(VFIO_PATH_PREFIX)
        && group.parse::<u32>().map(|g| g >= 1).unwrap_or(false)
    {
        return DeviceClass::Vfio;
    }

    let block_prefixes = ["/dev/sd", "/dev/hd", "/dev/vd", "/dev/ida/"];
    for prefix in block_prefixes {
        if host_path.len() > prefix.len() && host_path.starts_with(prefix) {
            return DeviceClass::Block;
        }
    }

    DeviceClass::Generic
}

/// Build a device from its container specification, resolving the
/// host path from sysfs when only major:minor is known.
pub fn new_device(spec: &DeviceSpec) -> Result<Device> {
    let host_path = if spec.host_path.as_os_str().is_empty() {
        resolve_device_path(spec.major, spec.minor, &spec.dev_type)?
    } else {
        spec.host_path.clone()
    };
    let info = DeviceInfo::from_spec(spec, host_path.clone());

    let device = match classify(&host_path.display().to_string()) {
        DeviceClass::Vfio => Device::Vfio {
            bdfs: Vec::new(),
            info,
        },
        DeviceClass::Block => Device::Block {
            virt_path: PathBuf::new(),
            index: 0,
            info,
        },
        DeviceClass::Generic => Device::Generic { info },
    };
    Ok(device)
}

/// Resolve `major:minor` to its `/dev` path via the sysfs uevent
/// record. Unsupported device types resolve to an empty path, which
/// classifies as generic; that is a skip, not an error.
pub fn resolve_device_path(major: i64, minor: i64, dev_type: &str) -> Result<PathBuf> {
    let kind = match dev_type {
        "c" | "u" => "char",
        "b" => "block",
        _ => return Ok(PathBuf::new()),
    };
    let uevent = PathBuf::from(SYS_DEV_PREFIX)
        .join(kind)
        .join(format!("{major}:{minor}"))
        .join("uevent");
    let content = std::fs::read_to_string(&uevent).map_err(|e| {
        Error::DeviceAttach(format!("read {}: {e}", uevent.display()))
    })?;

    for line in content.lines() {
        if let Some(devname) = line.strip_prefix("DEVNAME=") {
            return Ok(PathBuf::from("/dev").join(devname));
        }
    }
    Err(Error::DeviceAttach(format!(
        "no DEVNAME in {}",
        uevent.display()
    )))
}

/// Extract `BB:SS.F` from a full `DDDD:BB:SS.F` PCI address.
pub fn parse_bdf(full: &str) -> Result<String> {
    let parts: Vec<&str> = full.split(':').collect();
    if parts.len() != 3 {
        return Err(Error::DeviceAttach(format!("malformed BDF {full:?}")));
    }
    let (slot, function) = parts[2]
        .split_once('.')
        .ok_or_else(|| Error::DeviceAttach(format!("malformed BDF {full:?}")))?;
    for (field, width) in [
        (parts[0], 4),
        (parts[1], 2),
        (slot, 2),
        (function, 1),
    ] {
        if field.len() != width || !field.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::DeviceAttach(format!("malformed BDF {full:?}")));
        }
    }
    Ok(format!("{}:{}", parts[1], parts[2]))
}

/// List the BDFs of every device in an IOMMU group.
fn iommu_group_bdfs(group: &str) -> Result<Vec<String>> {
    let dir = PathBuf::from(SYS_IOMMU_GROUPS).join(group).join("devices");
    let mut bdfs = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .map_err(|e| Error::DeviceAttach(format!("read {}: {e}", dir.display())))?
    {
        let entry = entry.map_err(Error::PersistenceIo)?;
        if let Some(name) = entry.file_name().to_str() {
            bdfs.push(parse_bdf(name)?);
        }
    }
    bdfs.sort();
    Ok(bdfs)
}

/// Attach a device to the pod's VM.
///
/// Block devices reserve the next block slot; the reservation is
/// rolled back before the error propagates if the hotplug fails.
pub async fn attach_device(
    device: &mut Device,
    hypervisor: &mut dyn Hypervisor,
    pod_state: &mut PodState,
) -> Result<()> {
    match device {
        Device::Vfio { bdfs, info } => {
            let group = info
                .host_path
                .strip_prefix(VFIO_PATH_PREFIX)
                .map_err(|_| {
                    Error::DeviceAttach(format!(
                        "not a vfio path: {}",
                        info.host_path.display()
                    ))
                })?;
            let group_bdfs = iommu_group_bdfs(&group.display().to_string())?;
            for bdf in &group_bdfs {
                hypervisor
                    .add_device(DeviceData::Vfio { bdf: bdf.clone() })
                    .await?;
                info!(bdf = %bdf, "VFIO device attached");
            }
            *bdfs = group_bdfs;
        }
        Device::Block {
            virt_path,
            index,
            info,
        } => {
            let slot = pod_state.block_index;
            pod_state.block_index += 1;

            let drive = Drive {
                path: info.host_path.clone(),
                index: slot,
                readonly: false,
            };
            let guest_path = drive.virt_path();
            if let Err(e) = hypervisor.add_device(DeviceData::Block(drive)).await {
                pod_state.block_index -= 1;
                return Err(e);
            }
            *index = slot;
            *virt_path = guest_path;
            info!(host = %info.host_path.display(), slot, "Block device attached");
        }
        Device::Generic { info } => {
            debug!(host = %info.host_path.display(), "Generic device needs no host attach");
        }
    }
    Ok(())
}

/// Detach a device, returning any block slot it held.
pub async fn detach_device(
    device: &Device,
    hypervisor: &mut dyn Hypervisor,
    pod_state: &mut PodState,
) -> Result<()> {
    match device {
        Device::Vfio { bdfs, .. } => {
            for bdf in bdfs {
                hypervisor
                    .remove_device(DeviceData::Vfio { bdf: bdf.clone() })
                    .await?;
            }
        }
        Device::Block { index, info, .. } => {
            hypervisor
                .remove_device(DeviceData::Block(Drive {
                    path: info.host_path.clone(),
                    index: *index,
                    readonly: false,
                }))
                .await?;
            pod_state.block_index = pod_state.block_index.saturating_sub(1);
        }
        Device::Generic { .. } => {}
    }
    Ok(())
}

impl Device {
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Device::Vfio { info, .. } => info,
            Device::Block { info, .. } => info,
            Device::Generic { info } => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("/dev/vfio/16"), DeviceClass::Vfio);
        assert_eq!(classify("/dev/sda"), DeviceClass::Block);
        assert_eq!(classify("/dev/hda"), DeviceClass::Block);
        assert_eq!(classify("/dev/vdzzz"), DeviceClass::Block);
        assert_eq!(classify("/dev/ida/c0d0p10"), DeviceClass::Block);
        assert_eq!(classify("/dev/tty"), DeviceClass::Generic);
        assert_eq!(classify("/dev/vfio/"), DeviceClass::Generic);
        assert_eq!(classify("/dev/vfio/vfio"), DeviceClass::Generic);
        assert_eq!(classify("/dev/sd"), DeviceClass::Generic);
    }

    #[test]
    fn test_parse_bdf() {
        assert_eq!(parse_bdf("0000:02:10.0").unwrap(), "02:10.0");
        assert!(parse_bdf("0000:0210.0").is_err());
        assert!(parse_bdf("02:10.0").is_err());
        assert!(parse_bdf("0000:02:10").is_err());
        assert!(parse_bdf("zzzz:02:10.0").is_err());
    }

    #[test]
    fn test_unsupported_devtype_resolves_empty() {
        assert_eq!(resolve_device_path(1, 3, "p").unwrap(), PathBuf::new());
    }

    #[tokio::test]
    async fn test_block_attach_reserves_and_detach_returns_slot() {
        use vpod_hypervisor::MockHypervisor;

        let mut hypervisor = MockHypervisor::new();
        let mut state = PodState::default();
        let mut device = new_device(&DeviceSpec {
            host_path: "/dev/sdb".into(),
            container_path: "/dev/sdb".into(),
            dev_type: "b".into(),
            ..Default::default()
        })
        .unwrap();

        attach_device(&mut device, &mut hypervisor, &mut state)
            .await
            .unwrap();
        assert_eq!(state.block_index, 1);
        match &device {
            Device::Block { virt_path, index, .. } => {
                assert_eq!(*index, 0);
                assert_eq!(virt_path, &PathBuf::from("/dev/vda"));
            }
            other => panic!("expected block device, got {other:?}"),
        }

        detach_device(&device, &mut hypervisor, &mut state)
            .await
            .unwrap();
        assert_eq!(state.block_index, 0);
    }
}
