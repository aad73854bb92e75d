//! The one mutable object of a build.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::cleanup;
use crate::common::{create_scratch_dir, remove_empty_dir};
use crate::disk::{BlockDevice, ImageSpec};
use crate::host::Host;
use crate::mount::MountStack;

/// Everything a build has acquired, so it can all be given back.
///
/// Unwinding happens through [`CleanupController::unwind`]; dropping a
/// context that was never unwound (a panic between stages) unwinds it as a
/// last resort.
///
/// [`CleanupController::unwind`]: crate::cleanup::CleanupController::unwind
pub struct BuildContext {
    pub host: Arc<dyn Host>,
    pub spec: ImageSpec,
    pub device: Option<BlockDevice>,
    pub mounts: MountStack,
    /// Scratch mount point for the image root.
    pub root_dir: PathBuf,
    /// Empty directory bound over `sys/firmware` inside the chroot.
    pub masked_dir: PathBuf,
    unwound: bool,
}

impl BuildContext {
    /// Create the scratch directories under `work_dir`.
    pub fn new(host: Arc<dyn Host>, spec: ImageSpec, work_dir: &Path) -> Result<Self> {
        let root_dir = create_scratch_dir(work_dir, "vmbake-root-")?;
        let masked_dir = match create_scratch_dir(work_dir, "vmbake-masked-") {
            Ok(dir) => dir,
            Err(e) => {
                let _ = remove_empty_dir(&root_dir);
                return Err(e);
            }
        };

        Ok(Self {
            host,
            spec,
            device: None,
            mounts: MountStack::new(),
            root_dir,
            masked_dir,
            unwound: false,
        })
    }

    pub fn is_unwound(&self) -> bool {
        self.unwound
    }

    pub(crate) fn mark_unwound(&mut self) {
        self.unwound = true;
    }

    /// True when nothing is attached or mounted any more.
    pub fn is_released(&self) -> bool {
        self.mounts.is_empty() && !self.device.as_ref().is_some_and(|d| d.attached)
    }
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if !self.unwound {
            warn!("build context dropped without cleanup, unwinding now");
            let report = cleanup::unwind(self);
            if !report.is_clean() {
                warn!("{}", report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::host::RecordingHost;
    use crate::mount::MountEntry;
    use tempfile::TempDir;

    #[test]
    fn test_new_creates_scratch_dirs() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let ctx = BuildContext::new(host, BuildConfig::default().image_spec(), tmp.path()).unwrap();
        assert!(ctx.root_dir.is_dir());
        assert!(ctx.masked_dir.is_dir());
        assert!(ctx.is_released());
        assert!(!ctx.is_unwound());
    }

    #[test]
    fn test_drop_unwinds() {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(RecordingHost::new());
        let (root, masked) = {
            let mut ctx = BuildContext::new(
                host.clone(),
                BuildConfig::default().image_spec(),
                tmp.path(),
            )
            .unwrap();
            let root = ctx.root_dir.clone();
            let dev = std::path::Path::new("/dev/loop7p2");
            ctx.mounts
                .acquire(host.as_ref(), MountEntry::device(root.clone(), dev, "btrfs"))
                .unwrap();
            ctx.mounts
                .acquire(host.as_ref(), MountEntry::pseudo(root.join("proc"), "proc"))
                .unwrap();
            (ctx.root_dir.clone(), ctx.masked_dir.clone())
        };
        assert!(host.mounted().is_empty());
        assert!(!root.exists());
        assert!(!masked.exists());
    }
}
