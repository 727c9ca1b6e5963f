//! Lifecycle hook execution.
//!
//! Hooks are external binaries fed an OCI-compatible State document
//! on stdin. preStart and postStart run inside the pod's netns;
//! postStop runs in the default namespace. A preStart failure aborts
//! the operation, the others are logged and tolerated.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use vpod_shared::config::Hook;
use vpod_shared::{Error, Result};

/// OCI State document handed to every hook.
#[derive(Debug, Clone, Serialize)]
pub struct HookState {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    pub id: String,
    pub status: String,
    pub pid: u32,
    pub bundle: String,
}

impl HookState {
    pub fn new(pod_id: &str, status: &str, bundle: &Path) -> Self {
        Self {
            oci_version: "1.0.0".into(),
            id: pod_id.to_string(),
            status: status.to_string(),
            pid: std::process::id(),
            bundle: bundle.display().to_string(),
        }
    }
}

async fn run_hook(hook: &Hook, state: &HookState, netns: Option<&Path>) -> Result<()> {
    let mut cmd = Command::new(&hook.path);
    cmd.args(&hook.args);
    for env in &hook.env {
        if let Some((key, value)) = env.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    if let Some(netns) = netns {
        let netns = netns.to_path_buf();
        unsafe {
            cmd.pre_exec(move || {
                let f = std::fs::File::open(&netns)?;
                nix::sched::setns(&f, nix::sched::CloneFlags::CLONE_NEWNET)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }
    }

    debug!(hook = %hook.path.display(), "Running hook");
    let mut child = cmd
        .spawn()
        .map_err(|e| Error::InvalidConfig(format!("hook {}: {e}", hook.path.display())))?;

    if let Some(mut stdin) = child.stdin.take() {
        let doc = serde_json::to_vec(state)?;
        let _ = stdin.write_all(&doc).await;
        // Dropping closes the pipe so the hook sees EOF.
    }

    let status = if hook.timeout_secs > 0 {
        let waited =
            tokio::time::timeout(Duration::from_secs(hook.timeout_secs), child.wait()).await;
        match waited {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(Error::Timeout(format!(
                    "hook {}",
                    hook.path.display()
                )));
            }
        }
    } else {
        child.wait().await?
    };

    if !status.success() {
        return Err(Error::InvalidConfig(format!(
            "hook {} exited with {status}",
            hook.path.display()
        )));
    }
    Ok(())
}

/// Run a hook list. `fatal` hooks propagate their first failure;
/// non-fatal failures are logged and the remaining hooks still run.
pub async fn run_hooks(
    hooks: &[Hook],
    state: &HookState,
    netns: Option<&Path>,
    fatal: bool,
) -> Result<()> {
    for hook in hooks {
        match run_hook(hook, state, netns).await {
            Ok(()) => {}
            Err(e) if fatal => return Err(e),
            Err(e) => {
                warn!(hook = %hook.path.display(), error = %e, "Hook failed, continuing");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn hook(path: &str, args: &[&str]) -> Hook {
        Hook {
            path: PathBuf::from(path),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            timeout_secs: 5,
        }
    }

    fn state() -> HookState {
        HookState::new("pod-1", "created", Path::new("/tmp/bundle"))
    }

    #[tokio::test]
    async fn test_successful_hook() {
        run_hooks(&[hook("/bin/true", &[])], &state(), None, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fatal_hook_failure_propagates() {
        let err = run_hooks(&[hook("/bin/false", &[])], &state(), None, true).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_non_fatal_hook_failure_is_swallowed() {
        run_hooks(
            &[hook("/bin/false", &[]), hook("/bin/true", &[])],
            &state(),
            None,
            false,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hook_reads_state_from_stdin() {
        // cat consumes stdin and exits zero only if the pipe works.
        run_hooks(&[hook("/bin/cat", &[])], &state(), None, true)
            .await
            .unwrap();
    }
}
