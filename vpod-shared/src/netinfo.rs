//! Guest-facing network descriptions.
//!
//! These are what the agent receives: the network engine translates
//! host-side endpoints into this shape before handing them over.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Label the agent understands for the default route destination.
pub const DEFAULT_ROUTE_LABEL: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAddress {
    pub address: IpAddr,
    pub prefix_len: u8,
}

/// One guest-visible interface mirroring a host endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuestInterface {
    /// Guest device the agent binds the configuration to.
    pub device: String,
    /// Interface name inside the guest.
    pub name: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub mac_addr: String,
}

/// One guest route. `dest` is either a CIDR or the `default` label.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuestRoute {
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub device: String,
}

/// DNS configuration, supplied only by network plugins.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dns {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
}

/// Everything the agent needs to bring the guest network up.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GuestNetworkInfo {
    #[serde(default)]
    pub interfaces: Vec<GuestInterface>,
    #[serde(default)]
    pub routes: Vec<GuestRoute>,
    #[serde(default)]
    pub dns: Dns,
}
