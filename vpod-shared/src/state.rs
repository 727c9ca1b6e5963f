//! Pod and container runtime state records.
//!
//! These are the documents persisted under the run root. The pod and
//! container lifecycles share one state alphabet; the transition
//! matrices differ and are encoded here so every mutating operation
//! checks against the same graph.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Ready,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Ready => "ready",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl RunState {
    /// Whether a pod may move from `self` to `to`.
    ///
    /// Pausing is only legal from Running and resuming only from
    /// Paused; a Ready pod may be stopped directly (idempotent stop)
    /// and a Stopped pod may be started again.
    pub fn pod_transition_allowed(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Ready, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Running)
        )
    }

    /// Whether a container may move from `self` to `to`.
    pub fn container_transition_allowed(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Ready, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Stopped, Running)
        )
    }

    /// Container states compatible with a pod in state `self`.
    ///
    /// A container is never further along its lifecycle than its pod.
    pub fn allows_container_state(self, container: RunState) -> bool {
        use RunState::*;
        match self {
            Ready => matches!(container, Ready | Stopped),
            Running => matches!(container, Ready | Running | Stopped),
            Paused => matches!(container, Paused | Ready | Stopped),
            Stopped => matches!(container, Ready | Stopped),
        }
    }
}

pub fn check_pod_transition(from: RunState, to: RunState) -> Result<()> {
    if from.pod_transition_allowed(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

pub fn check_container_transition(from: RunState, to: RunState) -> Result<()> {
    if from.container_transition_allowed(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// Persisted pod state (`<run>/<podID>/state.json`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodState {
    pub state: RunState,
    /// Proxy URL, set once per VM lifetime at register time and
    /// cleared on unregister.
    #[serde(default)]
    pub url: String,
    /// Host pid of the proxy process, 0 when none is running.
    #[serde(default)]
    pub proxy_pid: u32,
    /// Monotonic counter of consumed virtio-blk slots.
    #[serde(default)]
    pub block_index: u32,
}

/// Persisted container state (`<run>/<podID>/<cID>/state.json`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContainerState {
    pub state: RunState,
    /// Non-empty iff the rootfs is served from a hotplugged block
    /// device instead of the shared filesystem.
    #[serde(default)]
    pub fstype: String,
    /// Guest drive name of the hotplugged rootfs, if any.
    #[serde(default)]
    pub hotplugged_drive: String,
    /// Block slot consumed by the rootfs drive.
    #[serde(default)]
    pub block_index: u32,
}

/// Persisted process record (`<run>/<podID>/<cID>/process.json`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Process {
    /// Opaque proxy-minted token naming the in-guest process.
    pub token: String,
    /// Host pid of the shim representing the process.
    pub pid: u32,
    pub start_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_transition_graph() {
        use RunState::*;
        assert!(Ready.pod_transition_allowed(Running));
        assert!(Ready.pod_transition_allowed(Stopped));
        assert!(Running.pod_transition_allowed(Paused));
        assert!(Paused.pod_transition_allowed(Running));
        assert!(Running.pod_transition_allowed(Stopped));
        assert!(Stopped.pod_transition_allowed(Running));

        // Strict graph: no pausing a pod that never ran, no going
        // back to ready.
        assert!(!Ready.pod_transition_allowed(Paused));
        assert!(!Stopped.pod_transition_allowed(Ready));
        assert!(!Paused.pod_transition_allowed(Ready));
        assert!(!Running.pod_transition_allowed(Ready));
        assert!(!Stopped.pod_transition_allowed(Paused));
    }

    #[test]
    fn test_container_never_ahead_of_pod() {
        use RunState::*;
        assert!(Ready.allows_container_state(Ready));
        assert!(!Ready.allows_container_state(Running));
        assert!(Running.allows_container_state(Running));
        assert!(Running.allows_container_state(Ready));
        assert!(!Stopped.allows_container_state(Running));
        assert!(Paused.allows_container_state(Paused));
        assert!(!Ready.allows_container_state(Paused));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let state = PodState {
            state: RunState::Ready,
            ..Default::default()
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains(r#""state":"ready""#));

        let back: PodState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_invalid_transition_error_names_states() {
        let err = check_pod_transition(RunState::Stopped, RunState::Ready).unwrap_err();
        assert!(err.to_string().contains("stopped"));
        assert!(err.to_string().contains("ready"));
    }
}
