//! Error types shared across the workspace.

use thiserror::Error;

use crate::state::RunState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing identifier")]
    MissingId,

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("hypervisor: {0}")]
    HypervisorFailure(String),

    #[error("agent: {0}")]
    AgentFailure(String),

    #[error("proxy: {0}")]
    ProxyFailure(String),

    #[error("shim: {0}")]
    ShimFailure(String),

    #[error("network setup: {0}")]
    NetworkSetup(String),

    #[error("device attach: {0}")]
    DeviceAttach(String),

    #[error("persistence: {0}")]
    PersistenceIo(#[from] std::io::Error),

    #[error("corrupt state: {0}")]
    CorruptState(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::CorruptState(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
