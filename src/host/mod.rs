//! The seam every OS side effect of a build goes through.
//!
//! Stage code never spawns a process or calls `mount(2)` directly; it asks a
//! [`Host`]. [`SystemHost`] does the real thing. `RecordingHost` records
//! the requests and simulates loop devices and mount state, which is how the
//! pipeline is tested without root.

// Test double for this crate's tests and downstream ones. Build with
// `--no-default-features` to leave it out.
#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
mod recording;

#[cfg(any(test, feature = "test-utils"))]
#[doc(hidden)]
pub use recording::{populate_minimal_tree, HostOp, RecordingHost};

use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use tracing::debug;

use crate::mount::{MountEntry, MountSource};
use crate::process::{Cmd, CommandResult};

/// Outcome of a single unmount attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmounted {
    Released,
    /// Busy; detached lazily and will go away once unused.
    Lazy,
    /// Nothing was mounted there.
    NotMounted,
}

pub trait Host: Send + Sync {
    /// Run an external command.
    fn run(&self, cmd: Cmd) -> Result<CommandResult>;

    /// Perform one mount described by `entry`.
    fn mount(&self, entry: &MountEntry) -> Result<()>;

    /// Unmount `target`, falling back to a lazy detach if it is busy.
    fn unmount(&self, target: &Path) -> Result<Unmounted>;

    /// Whether a device node exists and is usable.
    fn device_ready(&self, path: &Path) -> bool;
}

/// The real host: child processes and mount syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        debug!("$ {}", cmd);
        cmd.run()
    }

    fn mount(&self, entry: &MountEntry) -> Result<()> {
        let flags = entry.options.flags();
        let data = entry.options.data.as_deref();
        let target = entry.target.as_path();

        match &entry.source {
            MountSource::Device { path, fstype } => {
                mount(Some(path.as_path()), target, Some(fstype.as_str()), flags, data)?;
            }
            MountSource::Pseudo { fstype } => {
                mount(Some(fstype.as_str()), target, Some(fstype.as_str()), flags, data)?;
            }
            MountSource::Bind { path } => {
                mount(
                    Some(path.as_path()),
                    target,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )?;
                // The kernel ignores MS_RDONLY and friends on the initial
                // bind; they only apply on a remount.
                let extra = flags - MsFlags::MS_RDONLY;
                if entry.options.read_only || !extra.is_empty() {
                    let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | flags;
                    if let Err(e) = mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
                        let _ = umount2(target, MntFlags::MNT_DETACH);
                        return Err(e).context("Failed to remount bind read-only");
                    }
                }
            }
        }
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<Unmounted> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(Unmounted::Released),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(Unmounted::NotMounted),
            Err(Errno::EBUSY) => {
                umount2(target, MntFlags::MNT_DETACH).with_context(|| {
                    format!("Lazy unmount of busy {} failed", target.display())
                })?;
                Ok(Unmounted::Lazy)
            }
            Err(e) => bail!("umount {} failed: {}", target.display(), e),
        }
    }

    fn device_ready(&self, path: &Path) -> bool {
        path.metadata()
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }
}
