//! Per-pod network engine.
//!
//! Three models share one surface: noop does nothing, the default
//! model scans an existing netns, and the plugin model delegates
//! interface allocation to an external binary before rescanning.
//! Either way the result is a set of bridged veth↔tap endpoints whose
//! taps are registered with the hypervisor.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vpod_shared::config::{NetworkConfig, NetworkModel, PodConfig};
use vpod_shared::netinfo::Dns;
use vpod_shared::{Error, Result};
use vpod_hypervisor::{DeviceData, Hypervisor, NetDevice};

pub mod endpoint;
pub mod link;
pub mod netns;
pub mod plugin;
pub mod scan;

pub use endpoint::{Endpoint, guest_network_info};
pub use netns::NetnsGuard;
pub use plugin::PluginNetwork;

/// The pod's network namespace and everything built inside it.
/// Persisted as `network.json` under the pod run directory.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkNamespace {
    pub path: PathBuf,
    /// Whether the engine created the netns and owns its deletion.
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Shared surface of the three network models.
#[async_trait]
pub trait Network: Send {
    /// Create or open the pod netns.
    async fn init(&mut self, pod_id: &str, config: &NetworkConfig) -> Result<NetworkNamespace>;

    /// Execute a callback with the calling thread inside the netns.
    fn run(&self, netns_path: &Path, f: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()>;

    /// Build endpoints in the netns and register their taps with the
    /// hypervisor.
    async fn add(
        &mut self,
        hypervisor: &mut dyn Hypervisor,
        config: &PodConfig,
        ns: &mut NetworkNamespace,
    ) -> Result<()>;

    /// Tear endpoints down in inverse order; delete the netns only if
    /// the engine created it. Safe to call on partial state.
    async fn remove(&mut self, ns: &mut NetworkNamespace) -> Result<()>;
}

pub fn new_network(model: NetworkModel) -> Box<dyn Network> {
    match model {
        NetworkModel::Noop => Box::new(NoopNetwork),
        NetworkModel::Default => Box::new(DefaultNetwork),
        NetworkModel::Plugin => Box::new(PluginNetwork::default()),
    }
}

/// No network changes at all.
pub struct NoopNetwork;

#[async_trait]
impl Network for NoopNetwork {
    async fn init(&mut self, _pod_id: &str, _config: &NetworkConfig) -> Result<NetworkNamespace> {
        Ok(NetworkNamespace::default())
    }

    fn run(&self, _netns_path: &Path, f: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
        f()
    }

    async fn add(
        &mut self,
        _hypervisor: &mut dyn Hypervisor,
        _config: &PodConfig,
        _ns: &mut NetworkNamespace,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove(&mut self, _ns: &mut NetworkNamespace) -> Result<()> {
        Ok(())
    }
}

/// CNM-style model: the netns already holds interfaces created by an
/// outer network manager; scan them and bridge each one.
pub struct DefaultNetwork;

#[async_trait]
impl Network for DefaultNetwork {
    async fn init(&mut self, pod_id: &str, config: &NetworkConfig) -> Result<NetworkNamespace> {
        init_namespace(pod_id, config)
    }

    fn run(&self, netns_path: &Path, f: Box<dyn FnOnce() -> Result<()> + Send>) -> Result<()> {
        netns::run_in_netns(netns_path, f)
    }

    async fn add(
        &mut self,
        hypervisor: &mut dyn Hypervisor,
        config: &PodConfig,
        ns: &mut NetworkNamespace,
    ) -> Result<()> {
        let endpoints = build_endpoints(
            &ns.path,
            &config.id,
            &config.network_config.interface_name,
            None,
        )?;
        register_endpoints(hypervisor, &endpoints).await?;
        ns.endpoints = endpoints;
        Ok(())
    }

    async fn remove(&mut self, ns: &mut NetworkNamespace) -> Result<()> {
        teardown_endpoints(ns)
    }
}

pub(crate) fn init_namespace(pod_id: &str, config: &NetworkConfig) -> Result<NetworkNamespace> {
    if config.netns_path.as_os_str().is_empty() {
        let path = netns::create_netns(pod_id)?;
        Ok(NetworkNamespace {
            path,
            created: true,
            endpoints: Vec::new(),
        })
    } else {
        if !config.netns_path.exists() {
            return Err(Error::NotFound(format!(
                "netns {}",
                config.netns_path.display()
            )));
        }
        Ok(NetworkNamespace {
            path: config.netns_path.clone(),
            created: false,
            endpoints: Vec::new(),
        })
    }
}

/// Enter the netns, scan its interfaces, and bridge one endpoint per
/// interface. The calling thread is pinned for the duration.
pub(crate) fn build_endpoints(
    netns_path: &Path,
    pod_id: &str,
    iface_override: &str,
    dns: Option<Dns>,
) -> Result<Vec<Endpoint>> {
    let netns_path = netns_path.to_path_buf();
    let pod_id = pod_id.to_string();
    let iface_override = iface_override.to_string();

    tokio::task::block_in_place(move || {
        let _guard = NetnsGuard::enter(&netns_path)?;
        tokio::runtime::Handle::current().block_on(async move {
            let (connection, handle, _) = rtnetlink::new_connection()
                .map_err(|e| Error::NetworkSetup(format!("netlink: {e}")))?;
            tokio::spawn(connection);

            let interfaces = scan::scan_interfaces(&handle).await?;
            let mut endpoints = Vec::new();
            for iface in interfaces {
                // Leftovers from an earlier aborted setup are not
                // endpoints; a subsequent remove clears them.
                if iface.name.ends_with("_vpod") {
                    warn!(name = %iface.name, "Skipping stale engine interface");
                    continue;
                }
                let index = endpoints.len() as u32;
                let name_override = if index == 0 { iface_override.as_str() } else { "" };
                let routes = scan::scan_routes(&handle, iface.index).await?;
                let mut ep = Endpoint::new(&pod_id, index, iface, name_override);
                ep.routes = routes;
                if let Some(dns) = &dns {
                    ep.dns = dns.clone();
                }
                link::bridge_endpoint(&handle, &mut ep).await?;
                endpoints.push(ep);
            }

            info!(pod_id = %pod_id, endpoints = endpoints.len(), "Endpoints bridged");
            Ok(endpoints)
        })
    })
}

pub(crate) async fn register_endpoints(
    hypervisor: &mut dyn Hypervisor,
    endpoints: &[Endpoint],
) -> Result<()> {
    for endpoint in endpoints {
        hypervisor
            .add_device(DeviceData::Net(NetDevice {
                tap_name: endpoint.tap_iface.name.clone(),
                mac_addr: endpoint.virt_iface.mac_addr.clone(),
            }))
            .await?;
    }
    Ok(())
}

pub(crate) fn teardown_endpoints(ns: &mut NetworkNamespace) -> Result<()> {
    if !ns.endpoints.is_empty() {
        let netns_path = ns.path.clone();
        let endpoints = ns.endpoints.clone();
        tokio::task::block_in_place(move || {
            let _guard = NetnsGuard::enter(&netns_path)?;
            tokio::runtime::Handle::current().block_on(async move {
                let (connection, handle, _) = rtnetlink::new_connection()
                    .map_err(|e| Error::NetworkSetup(format!("netlink: {e}")))?;
                tokio::spawn(connection);

                for endpoint in endpoints.iter().rev() {
                    link::unbridge_endpoint(&handle, endpoint).await?;
                }
                Ok::<_, Error>(())
            })
        })?;
        ns.endpoints.clear();
    }

    if ns.created {
        netns::delete_netns(&ns.path)?;
        ns.created = false;
    }
    Ok(())
}
