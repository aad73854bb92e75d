//! Interruption handling and the single unwind path.
//!
//! Every way a build can end (success, a stage error, SIGINT/SIGTERM, a
//! panic) goes through [`unwind`], which gives back what the
//! [`BuildContext`] holds in reverse order of acquisition: mounts, then the
//! loop device, then the scratch directories.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;
use tracing::{info, warn};

use crate::common::remove_empty_dir;
use crate::context::BuildContext;
use crate::disk::unbind;
use crate::error::{BuildError, Stage};

/// What an unwind did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Mounts popped off the stack (whether or not the unmount succeeded).
    pub mounts_released: usize,
    /// Loop device detached, if one was attached.
    pub detached: Option<PathBuf>,
    pub removed_dirs: Vec<PathBuf>,
    /// Everything that could not be released.
    pub failures: Vec<String>,
    /// The context had already been unwound; nothing was done.
    pub skipped: bool,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return f.write_str("cleanup: already unwound");
        }
        write!(f, "cleanup: {} mount(s) released", self.mounts_released)?;
        if let Some(ref dev) = self.detached {
            write!(f, ", detached {}", dev.display())?;
        }
        if !self.failures.is_empty() {
            write!(f, ", {} problem(s): {}", self.failures.len(), self.failures.join("; "))?;
        }
        Ok(())
    }
}

/// Watches for SIGINT/SIGTERM for the lifetime of a build.
pub struct CleanupController {
    interrupted: Arc<AtomicBool>,
    registrations: Vec<SigId>,
}

impl CleanupController {
    /// Register SIGINT and SIGTERM handlers that only set a flag.
    pub fn install() -> Result<Self> {
        let interrupted = Arc::new(AtomicBool::new(false));
        let mut registrations = Vec::new();
        for sig in [SIGINT, SIGTERM] {
            let id = signal_hook::flag::register(sig, Arc::clone(&interrupted))
                .with_context(|| format!("Failed to register handler for signal {}", sig))?;
            registrations.push(id);
        }
        Ok(Self {
            interrupted,
            registrations,
        })
    }

    /// A controller that never sees signals unless [`interrupt`](Self::interrupt)
    /// is called.
    pub fn detached() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            registrations: Vec::new(),
        }
    }

    /// Mark the build as interrupted, as a signal would.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Fail with [`BuildError::Interrupted`] if a signal has arrived.
    pub fn checkpoint(&self, stage: Stage) -> Result<(), BuildError> {
        if self.is_interrupted() {
            warn!("interrupt received, stopping before stage '{}'", stage);
            return Err(BuildError::Interrupted);
        }
        Ok(())
    }

    /// Release everything `ctx` holds. Only the first call does anything.
    pub fn unwind(&self, ctx: &mut BuildContext) -> CleanupReport {
        unwind(ctx)
    }
}

impl Drop for CleanupController {
    fn drop(&mut self) {
        for id in self.registrations.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Release mounts, detach the device and remove the scratch directories.
///
/// Best effort: each step runs even if an earlier one failed. Directory
/// removal is non-recursive, so a tree that is somehow still mounted is
/// never deleted.
pub fn unwind(ctx: &mut BuildContext) -> CleanupReport {
    let mut report = CleanupReport::default();
    if ctx.is_unwound() {
        report.skipped = true;
        return report;
    }
    ctx.mark_unwound();

    let host = ctx.host.clone();

    report.mounts_released = ctx.mounts.len();
    if let Err(e) = ctx.mounts.release(host.as_ref()) {
        for (target, err) in e.failures {
            report
                .failures
                .push(format!("unmount {}: {:#}", target.display(), err));
        }
    }

    if let Some(device) = ctx.device.as_mut() {
        if device.attached {
            match unbind(host.as_ref(), device) {
                Ok(()) => report.detached = Some(device.loop_path.clone()),
                Err(e) => {
                    warn!("failed to detach {}: {:#}", device.loop_path.display(), e);
                    report
                        .failures
                        .push(format!("detach {}: {:#}", device.loop_path.display(), e));
                }
            }
        }
    }

    for dir in [ctx.root_dir.clone(), ctx.masked_dir.clone()] {
        match remove_empty_dir(&dir) {
            Ok(()) => report.removed_dirs.push(dir),
            Err(e) => {
                warn!("{:#}", e);
                report.failures.push(format!("{:#}", e));
            }
        }
    }

    if report.is_clean() {
        info!("{}", report);
    } else {
        warn!("{}", report);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::disk::BlockDevice;
    use crate::host::RecordingHost;
    use crate::mount::MountEntry;
    use crate::process::Cmd;
    use crate::host::Host;
    use std::path::Path;
    use tempfile::TempDir;

    fn context(tmp: &TempDir, host: &Arc<RecordingHost>) -> BuildContext {
        BuildContext::new(host.clone(), BuildConfig::default().image_spec(), tmp.path()).unwrap()
    }

    fn attach(host: &RecordingHost, ctx: &mut BuildContext) {
        let out = host
            .run(Cmd::new("losetup").args(["--find", "--show", "--partscan", "/tmp/disk.raw"]))
            .unwrap();
        ctx.device = Some(BlockDevice::attached(
            PathBuf::from(out.stdout_trimmed()),
            PathBuf::from("/tmp/disk.raw"),
        ));
    }

    #[test]
    fn test_checkpoint() {
        let controller = CleanupController::detached();
        controller.checkpoint(Stage::Bind).unwrap();
        controller.interrupt();
        let err = controller.checkpoint(Stage::Mount).unwrap_err();
        assert!(matches!(err, BuildError::Interrupted));
    }

    #[test]
    fn test_unwind_releases_in_reverse_then_detaches() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let mut ctx = context(&tmp, &host);
        attach(&host, &mut ctx);

        let root = ctx.root_dir.clone();
        ctx.mounts
            .acquire(
                host.as_ref(),
                MountEntry::device(root.clone(), Path::new("/dev/loop7p2"), "btrfs"),
            )
            .unwrap();
        ctx.mounts
            .acquire(host.as_ref(), MountEntry::pseudo(root.join("proc"), "proc"))
            .unwrap();

        let report = CleanupController::detached().unwind(&mut ctx);
        assert!(report.is_clean(), "{}", report);
        assert_eq!(report.mounts_released, 2);
        assert_eq!(report.detached, Some(PathBuf::from("/dev/loop7")));
        assert_eq!(host.unmounted(), vec![root.join("proc"), root.clone()]);
        assert!(host.attached_loops().is_empty());
        assert!(!root.exists());
        assert!(ctx.is_released());

        // The detach comes after the last unmount.
        let ops = host.ops();
        let last_unmount = ops
            .iter()
            .rposition(|op| matches!(op, crate::host::HostOp::Unmount(_)))
            .unwrap();
        let detach = ops
            .iter()
            .position(|op| matches!(op, crate::host::HostOp::Run(l) if l.contains("--detach")))
            .unwrap();
        assert!(detach > last_unmount);
    }

    #[test]
    fn test_unwind_runs_once() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let mut ctx = context(&tmp, &host);
        attach(&host, &mut ctx);

        let first = unwind(&mut ctx);
        assert!(!first.skipped);
        let ops = host.ops().len();

        let second = unwind(&mut ctx);
        assert!(second.skipped);
        assert_eq!(host.ops().len(), ops);
    }

    #[test]
    fn test_unwind_continues_past_failures() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let mut ctx = context(&tmp, &host);
        attach(&host, &mut ctx);

        let root = ctx.root_dir.clone();
        ctx.mounts
            .acquire(
                host.as_ref(),
                MountEntry::device(root.clone(), Path::new("/dev/loop7p2"), "btrfs"),
            )
            .unwrap();
        fs_write(&root.join("etc/hostname"));
        host.fail_unmount("vmbake-root-");

        let report = unwind(&mut ctx);
        assert!(!report.is_clean());
        // The device is still detached and the masked dir still removed.
        assert!(host.attached_loops().is_empty());
        assert!(!ctx.masked_dir.exists());
        // The still-populated root is left alone.
        assert!(root.join("etc/hostname").exists());
    }

    fn fs_write(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "debian\n").unwrap();
    }
}
