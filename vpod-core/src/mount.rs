//! Host-side bind mounts into the pod's shared tree.

use std::path::Path;

use tracing::{debug, warn};

use vpod_shared::{Error, Result};

/// Bind-mount `source` onto `target`, creating the target directory.
/// A source that already sits at the target is left alone.
pub fn bind_mount(source: &Path, target: &Path) -> Result<bool> {
    if source == target {
        debug!(path = %target.display(), "Source already at share location");
        return Ok(false);
    }
    if !source.exists() {
        return Err(Error::NotFound(format!("mount source {}", source.display())));
    }

    if source.is_dir() {
        std::fs::create_dir_all(target)?;
    } else {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !target.exists() {
            std::fs::File::create(target)?;
        }
    }

    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        nix::mount::MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::PersistenceIo(std::io::Error::other(format!(
            "bind {} -> {}: {e}",
            source.display(),
            target.display()
        )))
    })?;
    debug!(source = %source.display(), target = %target.display(), "Bind mounted");
    Ok(true)
}

/// Lazily unmount a bind mount. Paths that are not mounted or already
/// gone are fine.
pub fn unmount(target: &Path) -> Result<()> {
    if !target.exists() {
        return Ok(());
    }
    match nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EINVAL) | Err(nix::errno::Errno::ENOENT) => Ok(()),
        Err(e) => {
            warn!(target = %target.display(), error = %e, "Unmount failed");
            Err(Error::PersistenceIo(std::io::Error::other(format!(
                "umount {}: {e}",
                target.display()
            ))))
        }
    }
}
