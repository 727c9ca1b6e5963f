//! Typed agent command set.
//!
//! These are the semantic requests the in-guest supervisor
//! understands. The proxy serializes them one frame at a time; the
//! concrete wire layout is the transport's business.

use serde::{Deserialize, Serialize};

use vpod_shared::netinfo::{Dns, GuestInterface, GuestRoute};

use crate::oci::{OciProcess, OciSpec};

/// One guest mount backing a container: either a 9p share or a
/// hotplugged block device.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Storage {
    /// `9p` or `blk`.
    pub driver: String,
    pub source: String,
    pub mount_point: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum AgentCmd {
    CreateSandbox {
        hostname: String,
        #[serde(default)]
        shared_storages: Vec<Storage>,
        #[serde(default)]
        dns: Dns,
    },
    DestroySandbox,
    CreateContainer {
        container_id: String,
        #[serde(default)]
        storages: Vec<Storage>,
        spec: OciSpec,
    },
    StartContainer {
        container_id: String,
    },
    RemoveContainer {
        container_id: String,
    },
    ExecProcess {
        container_id: String,
        exec_id: String,
        process: OciProcess,
    },
    SignalProcess {
        container_id: String,
        /// Empty targets every process in the container.
        exec_id: String,
        signal: i32,
    },
    WaitProcess {
        container_id: String,
        exec_id: String,
    },
    ReadStdout {
        container_id: String,
        exec_id: String,
    },
    ReadStderr {
        container_id: String,
        exec_id: String,
    },
    WriteStdin {
        container_id: String,
        exec_id: String,
        data: Vec<u8>,
    },
    CloseStdin {
        container_id: String,
        exec_id: String,
    },
    TtyResize {
        container_id: String,
        exec_id: String,
        rows: u16,
        cols: u16,
    },
    AddInterface(GuestInterface),
    RemoveInterface(GuestInterface),
    UpdateInterface(GuestInterface),
    AddRoute(Vec<GuestRoute>),
    RemoveRoute(Vec<GuestRoute>),
    OnlineCpuMem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentResponse {
    Ok,
    ExitCode { code: i32 },
    Data { data: Vec<u8> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd_frame_shape() {
        let cmd = AgentCmd::StartContainer {
            container_id: "c1".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains(r#""cmd":"start_container""#));
        let back: AgentCmd = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_response_round_trip() {
        let resp = AgentResponse::ExitCode { code: 137 };
        let json = serde_json::to_string(&resp).unwrap();
        let back: AgentResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, resp);
    }
}
