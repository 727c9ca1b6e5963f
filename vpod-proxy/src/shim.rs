//! Shim process management.
//!
//! One shim per container (plus one per exec session) represents the
//! in-guest process to the outer runtime: it carries stdio, forwards
//! signals, and exits with the process's exit code.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use vpod_shared::config::{ShimConfig, ShimType};
use vpod_shared::{Error, Result};

const WAIT_SHIM_PERIOD: Duration = Duration::from_millis(100);
const WAIT_SHIM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct ShimParams {
    pub container_id: String,
    pub token: String,
    pub url: String,
    /// Console TTY path; when set the shim takes it as its
    /// controlling terminal.
    pub console: String,
    pub detach: bool,
}

#[derive(Debug, Clone)]
pub enum ShimManager {
    Noop,
    Cc { path: PathBuf, debug: bool },
}

impl ShimManager {
    pub fn new(shim_type: ShimType, config: &ShimConfig) -> Result<Self> {
        match shim_type {
            ShimType::Noop => Ok(ShimManager::Noop),
            ShimType::CcShim => {
                if config.path.as_os_str().is_empty() {
                    return Err(Error::InvalidConfig("shim path missing".into()));
                }
                Ok(ShimManager::Cc {
                    path: config.path.clone(),
                    debug: config.debug,
                })
            }
        }
    }

    /// Launch the shim for one process token. Returns the shim pid,
    /// 0 for the noop shim.
    pub async fn start(&self, params: &ShimParams) -> Result<u32> {
        let (path, debug) = match self {
            ShimManager::Noop => return Ok(0),
            ShimManager::Cc { path, debug } => (path, *debug),
        };

        let mut cmd = Command::new(path);
        cmd.arg("-c")
            .arg(&params.container_id)
            .arg("-t")
            .arg(&params.token)
            .arg("-u")
            .arg(&params.url);
        if debug {
            cmd.arg("-d");
        }

        if !params.console.is_empty() {
            // Reopen the console as the shim's controlling terminal:
            // new session first, then TIOCSCTTY on the inherited fd.
            let console = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&params.console)
                .map_err(|e| {
                    Error::ShimFailure(format!("open console {}: {e}", params.console))
                })?;
            cmd.stdin(Stdio::from(console.try_clone().map_err(Error::PersistenceIo)?));
            cmd.stdout(Stdio::from(console.try_clone().map_err(Error::PersistenceIo)?));
            cmd.stderr(Stdio::from(console));
            unsafe {
                cmd.pre_exec(|| {
                    if nix::libc::setsid() < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if nix::libc::ioctl(0, nix::libc::TIOCSCTTY, 0) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        } else if params.detach {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
        }
        // Non-detach without a console inherits our stdio.

        debug!(container_id = %params.container_id, cmd = ?cmd.as_std(), "Spawning shim");
        let child = cmd
            .spawn()
            .map_err(|e| Error::ShimFailure(format!("spawn: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::ShimFailure("no pid for shim".into()))?;
        drop(child);

        info!(container_id = %params.container_id, pid, "Shim started");
        Ok(pid)
    }

    /// SIGKILL the shim. A shim that is already gone is not an error.
    pub fn stop(&self, pid: u32) -> Result<()> {
        if matches!(self, ShimManager::Noop) || pid == 0 {
            return Ok(());
        }
        match nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGKILL,
        ) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => {
                debug!(pid, "Shim already terminated");
                Ok(())
            }
            Err(e) => Err(Error::ShimFailure(format!("kill shim {pid}: {e}"))),
        }
    }

    /// Poll until the shim exits, up to the wait budget.
    pub async fn wait(&self, pid: u32) -> Result<()> {
        if matches!(self, ShimManager::Noop) || pid == 0 {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + WAIT_SHIM_TIMEOUT;
        loop {
            let alive = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                None,
            )
            .is_ok();
            if !alive {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pid, "Shim still alive after wait budget");
                return Err(Error::Timeout(format!("waiting for shim {pid}")));
            }
            tokio::time::sleep(WAIT_SHIM_PERIOD).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_shim_lifecycle() {
        let shim = ShimManager::new(ShimType::Noop, &ShimConfig::default()).unwrap();
        let pid = shim
            .start(&ShimParams {
                container_id: "c1".into(),
                token: "tok".into(),
                url: "noop://p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(pid, 0);
        shim.stop(pid).unwrap();
        shim.wait(pid).await.unwrap();
    }

    #[test]
    fn test_cc_shim_requires_path() {
        assert!(ShimManager::new(ShimType::CcShim, &ShimConfig::default()).is_err());
    }

    #[test]
    fn test_stop_ignores_missing_process() {
        let shim = ShimManager::Cc {
            path: "/bin/true".into(),
            debug: false,
        };
        // Pid 0 means "never started"; also covers ESRCH handling.
        shim.stop(0).unwrap();
    }
}
