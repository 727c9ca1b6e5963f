//! Endpoints: one bridged veth↔tap pair per guest interface.
//!
//! Names and MAC addresses are derived from the pod id and endpoint
//! index so repeated scans of the same pod converge on the same
//! devices.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vpod_shared::netinfo::{
    DEFAULT_ROUTE_LABEL, Dns, GuestInterface, GuestNetworkInfo, GuestRoute, IpAddress,
};

/// Host-side view of one network interface.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub mac_addr: String,
    #[serde(default)]
    pub addrs: Vec<IpAddress>,
    #[serde(default)]
    pub mtu: u32,
    /// Kernel ifindex, 0 when the device does not exist yet.
    #[serde(default)]
    pub index: u32,
}

/// One host route observed on an endpoint's interface. An empty
/// `dest` is the default route sentinel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouteInfo {
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub ipv6: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    /// Index within the pod; names and MAC derive from it.
    pub index: u32,
    /// The existing veth adopted from the netns. Its original MAC is
    /// what the guest interface mirrors.
    pub virt_iface: NetworkInterface,
    pub tap_iface: NetworkInterface,
    pub bridge_name: String,
    /// Name the interface gets inside the guest.
    pub guest_iface_name: String,
    #[serde(default)]
    pub routes: Vec<RouteInfo>,
    #[serde(default)]
    pub dns: Dns,
}

pub fn tap_name(index: u32) -> String {
    format!("tap{index}_vpod")
}

pub fn bridge_name(index: u32) -> String {
    format!("br{index}_vpod")
}

fn guest_iface_name(index: u32) -> String {
    format!("eth{index}")
}

/// Stable locally-administered MAC for `(pod_id, index)`.
pub fn derive_mac(pod_id: &str, index: u32) -> String {
    let mut hasher = DefaultHasher::new();
    pod_id.hash(&mut hasher);
    let h = hasher.finish().to_be_bytes();
    format!(
        "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
        h[0],
        h[1],
        h[2],
        index as u8
    )
}

impl Endpoint {
    /// Build an endpoint around an interface found in the netns. The
    /// guest interface name may be overridden for endpoint 0.
    pub fn new(pod_id: &str, index: u32, virt_iface: NetworkInterface, name_override: &str) -> Self {
        let guest_name = if name_override.is_empty() {
            guest_iface_name(index)
        } else {
            name_override.to_string()
        };
        let mtu = virt_iface.mtu;
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            virt_iface,
            tap_iface: NetworkInterface {
                name: tap_name(index),
                mac_addr: derive_mac(pod_id, index),
                mtu,
                ..Default::default()
            },
            bridge_name: bridge_name(index),
            guest_iface_name: guest_name,
            routes: Vec::new(),
            dns: Dns::default(),
        }
    }
}

/// Translate endpoints into the agent's guest network description.
///
/// IPv6 routes are dropped (the agent does not support them) and the
/// default-route sentinel is rewritten to the agent's literal label.
pub fn guest_network_info(endpoints: &[Endpoint]) -> GuestNetworkInfo {
    let mut interfaces = Vec::new();
    let mut routes = Vec::new();
    let mut dns = Dns::default();

    for endpoint in endpoints {
        interfaces.push(GuestInterface {
            device: endpoint.virt_iface.name.clone(),
            name: endpoint.guest_iface_name.clone(),
            ip_addresses: endpoint.virt_iface.addrs.clone(),
            mtu: endpoint.virt_iface.mtu,
            mac_addr: endpoint.virt_iface.mac_addr.clone(),
        });

        for route in &endpoint.routes {
            if route.ipv6 {
                continue;
            }
            let dest = if route.dest.is_empty() || route.dest == "0.0.0.0/0" || route.dest == "::/0"
            {
                DEFAULT_ROUTE_LABEL.to_string()
            } else {
                route.dest.clone()
            };
            routes.push(GuestRoute {
                dest,
                gateway: route.gateway.clone(),
                device: endpoint.guest_iface_name.clone(),
            });
        }

        // DNS comes only from plugins; scanning leaves it empty.
        if dns.servers.is_empty() && !endpoint.dns.servers.is_empty() {
            dns = endpoint.dns.clone();
        }
    }

    GuestNetworkInfo {
        interfaces,
        routes,
        dns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_derive_from_index() {
        let ep = Endpoint::new("pod-1", 2, NetworkInterface::default(), "");
        assert_eq!(ep.tap_iface.name, "tap2_vpod");
        assert_eq!(ep.bridge_name, "br2_vpod");
        assert_eq!(ep.guest_iface_name, "eth2");

        // All three names are distinct.
        assert_ne!(ep.tap_iface.name, ep.bridge_name);
        assert_ne!(ep.tap_iface.name, ep.guest_iface_name);
        assert_ne!(ep.bridge_name, ep.guest_iface_name);
    }

    #[test]
    fn test_guest_iface_name_override() {
        let ep = Endpoint::new("pod-1", 0, NetworkInterface::default(), "net0");
        assert_eq!(ep.guest_iface_name, "net0");
    }

    #[test]
    fn test_derived_mac_is_stable() {
        let a = derive_mac("pod-1", 0);
        assert_eq!(a, derive_mac("pod-1", 0));
        assert_ne!(a, derive_mac("pod-1", 1));
        assert_ne!(a, derive_mac("pod-2", 0));
        assert!(a.starts_with("02:00:"));
    }

    #[test]
    fn test_route_translation() {
        let mut ep = Endpoint::new("pod-1", 0, NetworkInterface::default(), "");
        ep.routes = vec![
            RouteInfo {
                dest: String::new(),
                gateway: "192.168.1.1".into(),
                ipv6: false,
            },
            RouteInfo {
                dest: "10.0.0.0/24".into(),
                gateway: String::new(),
                ipv6: false,
            },
            RouteInfo {
                dest: "fd00::/64".into(),
                gateway: String::new(),
                ipv6: true,
            },
        ];

        let info = guest_network_info(&[ep]);
        assert_eq!(info.routes.len(), 2);
        assert_eq!(info.routes[0].dest, "default");
        assert_eq!(info.routes[0].gateway, "192.168.1.1");
        assert_eq!(info.routes[1].dest, "10.0.0.0/24");
        assert_eq!(info.routes[1].device, "eth0");
    }

    #[test]
    fn test_explicit_default_sentinel_rewritten() {
        let mut ep = Endpoint::new("pod-1", 0, NetworkInterface::default(), "");
        ep.routes = vec![RouteInfo {
            dest: "0.0.0.0/0".into(),
            gateway: "10.0.0.1".into(),
            ipv6: false,
        }];
        let info = guest_network_info(&[ep]);
        assert_eq!(info.routes[0].dest, "default");
    }

    #[test]
    fn test_dns_carried_from_plugin_endpoint() {
        let mut ep = Endpoint::new("pod-1", 0, NetworkInterface::default(), "");
        ep.dns.servers = vec!["1.1.1.1".into()];
        let info = guest_network_info(&[ep]);
        assert_eq!(info.dns.servers, vec!["1.1.1.1"]);
    }
}
