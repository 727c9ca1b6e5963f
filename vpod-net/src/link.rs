//! Link-level plumbing: tap devices, bridges, veth adoption.
//!
//! Tap devices are created persistent over the tun chardev ioctl so
//! no file descriptor needs to stay open; everything else goes over
//! rtnetlink. All functions expect to run inside the pod's netns.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;

use futures::TryStreamExt;
use nix::libc::{self, IFNAMSIZ, c_char, c_short};
use rtnetlink::Handle;
use tracing::{debug, info};

use vpod_shared::{Error, Result};

use crate::endpoint::Endpoint;

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const TUNSETPERSIST: libc::Ioctl = 0x400454cb as libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: c_short) -> Self {
        let mut ifr = IfReq {
            ifr_name: [0; IFNAMSIZ],
            ifr_flags: flags,
            _padding: [0; 22],
        };
        for (i, byte) in name.bytes().enumerate() {
            if i >= IFNAMSIZ - 1 {
                break;
            }
            ifr.ifr_name[i] = byte as c_char;
        }
        ifr
    }
}

/// Create a persistent tap device.
pub fn create_tap(name: &str) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")
        .map_err(|e| Error::NetworkSetup(format!("open /dev/net/tun: {e}")))?;

    let ifr = IfReq::new(name, (libc::IFF_TAP | libc::IFF_NO_PI) as c_short);
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
        return Err(Error::NetworkSetup(format!(
            "TUNSETIFF {name}: {}",
            io::Error::last_os_error()
        )));
    }
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETPERSIST, 1) } < 0 {
        return Err(Error::NetworkSetup(format!(
            "TUNSETPERSIST {name}: {}",
            io::Error::last_os_error()
        )));
    }

    info!(name, "TAP device created");
    Ok(())
}

/// Find an interface index by name.
pub async fn interface_index(handle: &Handle, name: &str) -> Result<u32> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        _ => Err(Error::NetworkSetup(format!("interface {name} not found"))),
    }
}

pub async fn set_link_up(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("link up {index}: {e}")))
}

pub async fn set_link_down(handle: &Handle, index: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .down()
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("link down {index}: {e}")))
}

async fn set_link_mac(handle: &Handle, index: u32, mac: &str) -> Result<()> {
    let addr = parse_mac(mac)?;
    handle
        .link()
        .set(index)
        .address(addr.to_vec())
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("set mac {index}: {e}")))
}

async fn set_link_mtu(handle: &Handle, index: u32, mtu: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .mtu(mtu)
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("set mtu {index}: {e}")))
}

async fn set_link_master(handle: &Handle, index: u32, master: u32) -> Result<()> {
    handle
        .link()
        .set(index)
        .controller(master)
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("enslave {index} to {master}: {e}")))
}

pub async fn delete_link(handle: &Handle, name: &str) -> Result<()> {
    let index = match interface_index(handle, name).await {
        Ok(index) => index,
        // Already gone; remove is idempotent.
        Err(_) => return Ok(()),
    };
    handle
        .link()
        .del(index)
        .execute()
        .await
        .map_err(|e| Error::NetworkSetup(format!("delete {name}: {e}")))
}

pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::NetworkSetup(format!("invalid mac {mac:?}")));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::NetworkSetup(format!("invalid mac {mac:?}")))?;
    }
    Ok(out)
}

/// Bridge one endpoint inside the netns:
/// tap created and enabled, existing veth adopted and re-MACed, a
/// bridge created with both attached, all three up.
pub async fn bridge_endpoint(handle: &Handle, endpoint: &mut Endpoint) -> Result<()> {
    // 1. Tap.
    create_tap(&endpoint.tap_iface.name)?;
    let tap_index = interface_index(handle, &endpoint.tap_iface.name).await?;
    endpoint.tap_iface.index = tap_index;
    if endpoint.virt_iface.mtu > 0 {
        set_link_mtu(handle, tap_index, endpoint.virt_iface.mtu).await?;
    }

    // 2. Adopt the veth: its original MAC moved to the guest, the
    // derived one takes its place on the host side.
    let veth_index = interface_index(handle, &endpoint.virt_iface.name).await?;
    endpoint.virt_iface.index = veth_index;
    set_link_down(handle, veth_index).await?;
    set_link_mac(handle, veth_index, &endpoint.tap_iface.mac_addr).await?;

    // 3. Bridge with both attached.
    handle
        .link()
        .add()
        .bridge(endpoint.bridge_name.clone())
        .execute()
        .await
        .map_err(|e| {
            Error::NetworkSetup(format!("create bridge {}: {e}", endpoint.bridge_name))
        })?;
    let bridge_index = interface_index(handle, &endpoint.bridge_name).await?;
    set_link_master(handle, tap_index, bridge_index).await?;
    set_link_master(handle, veth_index, bridge_index).await?;

    set_link_up(handle, tap_index).await?;
    set_link_up(handle, veth_index).await?;
    set_link_up(handle, bridge_index).await?;

    debug!(
        tap = %endpoint.tap_iface.name,
        veth = %endpoint.virt_iface.name,
        bridge = %endpoint.bridge_name,
        "Endpoint bridged"
    );
    Ok(())
}

/// Tear one endpoint down in strict inverse order of
/// [`bridge_endpoint`]. Partial state from an aborted setup is fine;
/// each step tolerates devices that are already gone.
pub async fn unbridge_endpoint(handle: &Handle, endpoint: &Endpoint) -> Result<()> {
    if let Ok(veth_index) = interface_index(handle, &endpoint.virt_iface.name).await {
        let _ = set_link_down(handle, veth_index).await;
        let _ = set_link_master(handle, veth_index, 0).await;
        if !endpoint.virt_iface.mac_addr.is_empty() {
            let _ = set_link_mac(handle, veth_index, &endpoint.virt_iface.mac_addr).await;
        }
    }
    delete_link(handle, &endpoint.bridge_name).await?;
    delete_link(handle, &endpoint.tap_iface.name).await?;
    debug!(bridge = %endpoint.bridge_name, "Endpoint unbridged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:00:ca:fe:00:01").unwrap(),
            [0x02, 0x00, 0xca, 0xfe, 0x00, 0x01]
        );
        assert!(parse_mac("invalid").is_err());
        assert!(parse_mac("02:00:00:00:00").is_err());
        assert!(parse_mac("02:00:00:00:00:xx").is_err());
    }
}
