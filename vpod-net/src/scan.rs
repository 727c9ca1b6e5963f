//! Live netns scanning.
//!
//! Materializes the interfaces, addresses, and routes a netns already
//! has so endpoints mirror observed kernel state. Runs inside the
//! target netns.

use std::net::IpAddr;

use futures::TryStreamExt;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::{Handle, IpVersion};
use tracing::debug;

use vpod_shared::Result;
use vpod_shared::netinfo::IpAddress;

use crate::endpoint::{NetworkInterface, RouteInfo};

/// Enumerate every interface in the current netns except loopback.
pub async fn scan_interfaces(handle: &Handle) -> Result<Vec<NetworkInterface>> {
    let mut interfaces = Vec::new();

    let mut links = handle.link().get().execute();
    while let Some(link) = links
        .try_next()
        .await
        .map_err(|e| vpod_shared::Error::NetworkSetup(format!("link scan: {e}")))?
    {
        let index = link.header.index;
        let mut iface = NetworkInterface {
            index,
            ..Default::default()
        };
        for attr in &link.attributes {
            match attr {
                LinkAttribute::IfName(name) => iface.name = name.clone(),
                LinkAttribute::Address(mac) => {
                    iface.mac_addr = mac
                        .iter()
                        .map(|b| format!("{b:02x}"))
                        .collect::<Vec<_>>()
                        .join(":");
                }
                LinkAttribute::Mtu(mtu) => iface.mtu = *mtu,
                _ => {}
            }
        }
        if iface.name.is_empty() || iface.name == "lo" {
            continue;
        }

        iface.addrs = scan_addresses(handle, index).await?;
        debug!(name = %iface.name, addrs = iface.addrs.len(), "Scanned interface");
        interfaces.push(iface);
    }

    Ok(interfaces)
}

async fn scan_addresses(handle: &Handle, if_index: u32) -> Result<Vec<IpAddress>> {
    let mut addrs = Vec::new();
    let mut stream = handle
        .address()
        .get()
        .set_link_index_filter(if_index)
        .execute();
    while let Some(msg) = stream
        .try_next()
        .await
        .map_err(|e| vpod_shared::Error::NetworkSetup(format!("address scan: {e}")))?
    {
        let prefix_len = msg.header.prefix_len;
        for attr in &msg.attributes {
            if let AddressAttribute::Address(addr) = attr {
                // Link-local addresses are kernel-managed; the guest
                // derives its own.
                if let IpAddr::V6(v6) = addr
                    && (v6.segments()[0] & 0xffc0) == 0xfe80
                {
                    continue;
                }
                addrs.push(IpAddress {
                    address: *addr,
                    prefix_len,
                });
            }
        }
    }
    Ok(addrs)
}

/// Collect the routes using `if_index`, both families. IPv6 entries
/// are marked so the guest translation can drop them.
pub async fn scan_routes(handle: &Handle, if_index: u32) -> Result<Vec<RouteInfo>> {
    let mut routes = Vec::new();

    let mut v4_stream = handle.route().get(IpVersion::V4).execute();
    while let Some(route) = v4_stream
        .try_next()
        .await
        .map_err(|e| vpod_shared::Error::NetworkSetup(format!("route scan: {e}")))?
    {
        if route_oif(&route) == Some(if_index) {
            routes.push(route_info(&route, false));
        }
    }

    let mut v6_stream = handle.route().get(IpVersion::V6).execute();
    while let Some(route) = v6_stream
        .try_next()
        .await
        .map_err(|e| vpod_shared::Error::NetworkSetup(format!("route scan: {e}")))?
    {
        if route_oif(&route) == Some(if_index) {
            routes.push(route_info(&route, true));
        }
    }

    Ok(routes)
}

fn route_oif(route: &RouteMessage) -> Option<u32> {
    route.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Oif(index) => Some(*index),
        _ => None,
    })
}

fn route_info(route: &RouteMessage, ipv6: bool) -> RouteInfo {
    let prefix_len = route.header.destination_prefix_length;
    let mut dest = String::new();
    let mut gateway = String::new();

    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(v4)) => {
                dest = format!("{v4}/{prefix_len}");
            }
            RouteAttribute::Destination(RouteAddress::Inet6(v6)) => {
                dest = format!("{v6}/{prefix_len}");
            }
            RouteAttribute::Gateway(RouteAddress::Inet(v4)) => {
                gateway = v4.to_string();
            }
            RouteAttribute::Gateway(RouteAddress::Inet6(v6)) => {
                gateway = v6.to_string();
            }
            _ => {}
        }
    }

    // No destination attribute with prefix 0 is the default route;
    // dest stays empty as the sentinel.
    RouteInfo {
        dest,
        gateway,
        ipv6,
    }
}
