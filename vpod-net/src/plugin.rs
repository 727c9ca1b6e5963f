//! CNI-style plugin model.
//!
//! An external plugin allocates the netns interfaces; the engine then
//! rescans the namespace so the endpoints reflect what the kernel
//! actually has, not what the plugin claims. DNS is the one thing
//! taken from the plugin output, since it is not observable from the
//! kernel.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use vpod_shared::config::{NetworkConfig, PodConfig};
use vpod_shared::netinfo::Dns;
use vpod_shared::{Error, Result};
use vpod_hypervisor::Hypervisor;

use crate::{
    Network, NetworkNamespace, build_endpoints, init_namespace, netns, register_endpoints,
    teardown_endpoints,
};

#[derive(Default)]
pub struct PluginNetwork {
    config: NetworkConfig,
    pod_id: String,
}

async fn run_plugin(
    config: &NetworkConfig,
    command: &str,
    pod_id: &str,
    netns_path: &Path,
) -> Result<Vec<u8>> {
    if config.plugin_path.as_os_str().is_empty() {
        return Err(Error::InvalidConfig("network plugin path missing".into()));
    }

    let mut cmd = Command::new(&config.plugin_path);
    cmd.arg(command)
        .arg(pod_id)
        .env("CNI_COMMAND", command.to_uppercase())
        .env("CNI_CONTAINERID", pod_id)
        .env("CNI_NETNS", netns_path)
        .env("CNI_IFNAME", "eth0")
        .env("CNI_PATH", &config.plugin_conf_dir);

    debug!(plugin = %config.plugin_path.display(), command, "Running network plugin");
    let output = cmd
        .output()
        .await
        .map_err(|e| Error::NetworkSetup(format!("plugin spawn: {e}")))?;
    if !output.status.success() {
        return Err(Error::NetworkSetup(format!(
            "plugin {command} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(output.stdout)
}

/// Pull DNS out of the plugin's result document. Anything else the
/// plugin reports is reconciled by rescanning instead.
fn dns_from_plugin_output(stdout: &[u8]) -> Dns {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(stdout) else {
        return Dns::default();
    };
    let servers = value["dns"]["nameservers"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let searches = value["dns"]["search"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Dns { servers, searches }
}

#[async_trait]
impl Network for PluginNetwork {
    async fn init(&mut self, pod_id: &str, config: &NetworkConfig) -> Result<NetworkNamespace> {
        self.config = config.clone();
        self.pod_id = pod_id.to_string();
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
        let stdout = run_plugin(&config.network_config, "add", &config.id, &ns.path).await?;
        let dns = dns_from_plugin_output(&stdout);

        let endpoints = build_endpoints(
            &ns.path,
            &config.id,
            &config.network_config.interface_name,
            Some(dns),
        )?;
        register_endpoints(hypervisor, &endpoints).await?;
        ns.endpoints = endpoints;
        Ok(())
    }

    async fn remove(&mut self, ns: &mut NetworkNamespace) -> Result<()> {
        // Plugin teardown failure must not block reclaiming the
        // bridges and the netns itself.
        if !self.pod_id.is_empty()
            && let Err(e) = run_plugin(&self.config, "del", &self.pod_id, &ns.path).await
        {
            warn!(error = %e, "Network plugin teardown failed");
        }
        teardown_endpoints(ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_from_plugin_output() {
        let out = br#"{"dns":{"nameservers":["8.8.8.8","1.1.1.1"],"search":["corp.example"]}}"#;
        let dns = dns_from_plugin_output(out);
        assert_eq!(dns.servers, vec!["8.8.8.8", "1.1.1.1"]);
        assert_eq!(dns.searches, vec!["corp.example"]);
    }

    #[test]
    fn test_dns_missing_or_garbage_output() {
        assert_eq!(dns_from_plugin_output(b"{}"), Dns::default());
        assert_eq!(dns_from_plugin_output(b"not json"), Dns::default());
    }
}
