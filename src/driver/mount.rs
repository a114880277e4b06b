//! Node-side mount collaborator.
//!
//! The [`Mounter`] trait is the seam between the publish protocol and the
//! kernel: the driver logic is written against the trait, and
//! [`NodeMounter`] implements it with real mount syscalls and `/proc/mounts`
//! inspection.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::mount::MsFlags;
use tracing::debug;

use crate::error::CsiError;

/// Mount operations the node service depends on.
pub trait Mounter: Send + Sync {
    /// Mounts `source` on `target`. A `"bind"` entry in `options` selects a
    /// bind mount; `"ro"` requests read-only; the remaining options pass
    /// through to the filesystem.
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: Option<&str>,
        options: &[String],
    ) -> Result<(), CsiError>;

    /// Unmounts `target`. Unmounting something that is not mounted succeeds.
    fn unmount(&self, target: &str) -> Result<(), CsiError>;

    /// Heuristically decides whether `target` is NOT a mount point.
    fn is_likely_not_mount_point(&self, target: &Path) -> io::Result<bool>;

    /// Resolves the device mounted at `mount_path` and how many mounts
    /// reference that device. `("", 0)` when nothing is mounted there.
    fn get_device_name(&self, mount_path: &Path) -> Result<(String, u32), CsiError>;

    /// Creates an empty regular file to serve as a bind-mount target.
    fn make_file(&self, path: &Path) -> Result<(), CsiError>;
}

/// Production mounter backed by mount(2)/umount(2).
#[derive(Default)]
pub struct NodeMounter;

impl NodeMounter {
    pub fn new() -> Self {
        Self
    }
}

fn mount_error(e: nix::errno::Errno, what: &str) -> CsiError {
    match e {
        nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => {
            CsiError::PermissionDenied(format!("{what}: {e}"))
        }
        nix::errno::Errno::EINVAL => CsiError::InvalidArgument(format!("{what}: {e}")),
        _ => CsiError::Internal(format!("{what}: {e}")),
    }
}

impl Mounter for NodeMounter {
    fn mount(
        &self,
        source: &str,
        target: &str,
        fstype: Option<&str>,
        options: &[String],
    ) -> Result<(), CsiError> {
        let bind = options.iter().any(|o| o == "bind");
        let read_only = options.iter().any(|o| o == "ro");

        let mut flags = MsFlags::empty();
        if bind {
            flags |= MsFlags::MS_BIND;
        }
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }

        let data: Vec<&str> = options
            .iter()
            .map(String::as_str)
            .filter(|o| *o != "bind" && *o != "ro" && *o != "rw")
            .collect();
        let data = data.join(",");
        let data = if data.is_empty() {
            None
        } else {
            Some(data.as_str())
        };

        debug!(source, path = %target, ?fstype, ?options, "mounting");
        nix::mount::mount(Some(source), target, fstype, flags, data)
            .map_err(|e| mount_error(e, &format!("mount of {source} at {target} failed")))?;

        // A bind mount picks up MS_RDONLY only on a remount pass.
        if bind && read_only {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| mount_error(e, &format!("read-only remount of {target} failed")))?;
        }
        Ok(())
    }

    fn unmount(&self, target: &str) -> Result<(), CsiError> {
        match nix::mount::umount(target) {
            Ok(()) => Ok(()),
            // Not mounted; unmount is idempotent.
            Err(nix::errno::Errno::EINVAL) => {
                debug!(path = %target, "unmount target was not mounted");
                Ok(())
            }
            Err(e) => Err(CsiError::Internal(format!(
                "unmount of {target} failed: {e}"
            ))),
        }
    }

    fn is_likely_not_mount_point(&self, target: &Path) -> io::Result<bool> {
        let target_meta = std::fs::metadata(target)?;
        let parent = match target.parent() {
            Some(parent) => parent,
            None => return Ok(false),
        };
        let parent_meta = std::fs::metadata(parent)?;
        // A mount point lives on a different device than its parent.
        Ok(target_meta.dev() == parent_meta.dev())
    }

    fn get_device_name(&self, mount_path: &Path) -> Result<(String, u32), CsiError> {
        let mounts = std::fs::read_to_string("/proc/mounts")
            .map_err(|e| CsiError::Internal(format!("failed to read /proc/mounts: {e}")))?;
        let wanted = mount_path.to_string_lossy();

        let mut device = String::new();
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let (Some(dev), Some(path)) = (fields.next(), fields.next()) else {
                continue;
            };
            if path == wanted {
                device = dev.to_owned();
                break;
            }
        }
        if device.is_empty() {
            return Ok((String::new(), 0));
        }

        let count = mounts
            .lines()
            .filter(|line| line.split_whitespace().next() == Some(device.as_str()))
            .count() as u32;
        Ok((device, count))
    }

    fn make_file(&self, path: &Path) -> Result<(), CsiError> {
        match OpenOptions::new().create(true).write(true).open(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(CsiError::Internal(format!(
                "could not create file {}: {e}",
                path.display()
            ))),
        }
    }
}
