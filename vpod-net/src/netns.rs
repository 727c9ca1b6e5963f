//! Network namespace creation, scoped entry, and deletion.
//!
//! Entering a netns changes a property of the calling OS thread, so
//! every entry is scoped: [`NetnsGuard`] saves the original namespace
//! and restores it on drop, on every path. Creation runs on a
//! throwaway thread so the caller's namespace is never disturbed.

use std::fs::File;
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use tracing::{debug, error, info};

use vpod_shared::{Error, Result};

const NETNS_RUN_DIR: &str = "/var/run/netns";
const SELF_NS_NET: &str = "/proc/self/ns/net";

/// Scoped netns entry pinned to the current thread.
pub struct NetnsGuard {
    orig: File,
}

impl NetnsGuard {
    pub fn enter(path: &Path) -> Result<Self> {
        let orig = File::open(SELF_NS_NET)
            .map_err(|e| Error::NetworkSetup(format!("open {SELF_NS_NET}: {e}")))?;
        let target = File::open(path)
            .map_err(|e| Error::NetworkSetup(format!("open {}: {e}", path.display())))?;
        nix::sched::setns(&target, CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::NetworkSetup(format!("setns {}: {e}", path.display())))?;
        debug!(netns = %path.display(), "Entered netns");
        Ok(Self { orig })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = nix::sched::setns(&self.orig, CloneFlags::CLONE_NEWNET) {
            // Leaving the thread in a foreign namespace poisons the
            // whole process; this must never fail silently.
            error!(error = %e, "Failed to restore original netns");
        }
    }
}

/// Run `f` with the current thread inside `path`. The original
/// namespace is restored before returning, including on errors.
pub fn run_in_netns<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if path.as_os_str().is_empty() {
        return f();
    }
    let _guard = NetnsGuard::enter(path)?;
    f()
}

/// Create a named netns the way `ip netns add` does: unshare on a
/// scratch thread and bind-mount its namespace file.
pub fn create_netns(pod_id: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(NETNS_RUN_DIR)
        .map_err(|e| Error::NetworkSetup(format!("create {NETNS_RUN_DIR}: {e}")))?;

    let short_id = &pod_id[..pod_id.len().min(8)];
    let target = Path::new(NETNS_RUN_DIR).join(format!("vpod-{short_id}"));
    if target.exists() {
        return Err(Error::AlreadyExists(format!("netns {}", target.display())));
    }
    File::create(&target)
        .map_err(|e| Error::NetworkSetup(format!("create {}: {e}", target.display())))?;

    let mount_target = target.clone();
    std::thread::spawn(move || -> Result<()> {
        nix::sched::unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|e| Error::NetworkSetup(format!("unshare: {e}")))?;
        nix::mount::mount(
            Some(SELF_NS_NET),
            &mount_target,
            None::<&str>,
            nix::mount::MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            Error::NetworkSetup(format!("bind {}: {e}", mount_target.display()))
        })?;
        Ok(())
    })
    .join()
    .map_err(|_| Error::NetworkSetup("netns creation thread panicked".into()))??;

    info!(netns = %target.display(), "Created netns");
    Ok(target)
}

/// Delete a netns created by [`create_netns`]. Idempotent.
pub fn delete_netns(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if let Err(e) = nix::mount::umount2(path, nix::mount::MntFlags::MNT_DETACH)
        && e != nix::errno::Errno::EINVAL
    {
        return Err(Error::NetworkSetup(format!(
            "umount {}: {e}",
            path.display()
        )));
    }
    std::fs::remove_file(path)
        .map_err(|e| Error::NetworkSetup(format!("remove {}: {e}", path.display())))?;
    info!(netns = %path.display(), "Deleted netns");
    Ok(())
}
