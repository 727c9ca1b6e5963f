//! Capabilities advertised by a hypervisor adapter.

/// What an adapter can do beyond the base contract. The orchestrator
/// consults this before choosing block-based vs 9p-based rootfs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub block_device_hotplug: bool,
    pub multi_queue: bool,
}

impl Capabilities {
    pub fn block_device_hotplug_supported(&self) -> bool {
        self.block_device_hotplug
    }
}
