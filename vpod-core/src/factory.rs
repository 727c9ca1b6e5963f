//! Subsystem construction from typed configuration.

use vpod_shared::config::{
    AgentConfig, HypervisorType, ProxyConfig, ProxyType, ShimConfig, ShimType,
};
use vpod_shared::{Error, Result};
use vpod_agent::{Agent, HyperAgent, NoopAgent, Proxy};
use vpod_hypervisor::{CloudHypervisor, Hypervisor, MockHypervisor};
use vpod_proxy::{CcProxy, NoopProxy, ShimManager};

pub use vpod_net::new_network;

pub fn new_hypervisor(hypervisor_type: HypervisorType) -> Box<dyn Hypervisor> {
    match hypervisor_type {
        HypervisorType::CloudHypervisor => Box::new(CloudHypervisor::new()),
        HypervisorType::Mock => Box::new(MockHypervisor::new()),
    }
}

pub fn new_agent(config: &AgentConfig) -> Result<Box<dyn Agent>> {
    match config {
        AgentConfig::Noop => Ok(Box::new(NoopAgent::new())),
        AgentConfig::Hyper { .. } => Ok(Box::new(HyperAgent::new())),
        AgentConfig::Kata { .. } | AgentConfig::Sshd { .. } => Err(Error::InvalidConfig(
            format!("agent {config:?} is not supported"),
        )),
    }
}

pub fn new_proxy(proxy_type: ProxyType, config: &ProxyConfig) -> Box<dyn Proxy> {
    match proxy_type {
        ProxyType::Noop => Box::new(NoopProxy::new()),
        ProxyType::CcProxy => Box::new(CcProxy::new(config)),
    }
}

pub fn new_shim(shim_type: ShimType, config: &ShimConfig) -> Result<ShimManager> {
    ShimManager::new(shim_type, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_agents_are_rejected() {
        assert!(new_agent(&AgentConfig::Noop).is_ok());
        assert!(
            new_agent(&AgentConfig::Kata {
                grpc_socket: "/run/kata.sock".into()
            })
            .is_err()
        );
        assert!(
            new_agent(&AgentConfig::Sshd {
                username: "root".into(),
                server: "10.0.0.2".into(),
                port: 22,
            })
            .is_err()
        );
    }
}
