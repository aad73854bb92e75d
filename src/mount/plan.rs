//! The fixed mount order for populating an image.

use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::error::BuildError;

use super::MountEntry;

/// Block devices and host directories the plan is built from.
#[derive(Debug, Clone)]
pub struct MountPlanInput<'a> {
    /// Scratch directory the image root is mounted on.
    pub root: &'a Path,
    pub root_device: &'a Path,
    pub esp_device: &'a Path,
    /// Empty directory bound read-only over `sys/firmware`.
    pub masked_dir: &'a Path,
}

/// Every mount needed to work inside the image, in acquisition order.
///
/// The bind over `sys/firmware` hides the host's EFI variables, so package
/// scripts that probe firmware state inside the chroot see none.
pub fn mount_plan(input: &MountPlanInput<'_>, config: &BuildConfig) -> Vec<MountEntry> {
    let root = input.root;
    let at = |rel: &str| -> PathBuf { root.join(rel) };

    vec![
        MountEntry::device(root, input.root_device, "btrfs").data(config.root_mount_data()),
        MountEntry::device(at(&config.layout.esp_mount_point), input.esp_device, "vfat")
            .data(config.layout.esp_mount_options.clone()),
        MountEntry::pseudo(at("proc"), "proc")
            .nosuid()
            .noexec()
            .nodev(),
        MountEntry::pseudo(at("sys"), "sysfs")
            .read_only()
            .nosuid()
            .noexec()
            .nodev(),
        MountEntry::bind(at("sys/firmware"), input.masked_dir).read_only(),
        MountEntry::pseudo(at("dev"), "devtmpfs")
            .nosuid()
            .data("mode=0755"),
        MountEntry::pseudo(at("dev/pts"), "devpts")
            .nosuid()
            .noexec()
            .data("mode=0620,gid=5"),
        MountEntry::pseudo(at("dev/shm"), "tmpfs")
            .nosuid()
            .nodev()
            .data("mode=1777"),
        MountEntry::pseudo(at("run"), "tmpfs")
            .nosuid()
            .nodev()
            .data("mode=0755"),
        MountEntry::pseudo(at("tmp"), "tmpfs")
            .nosuid()
            .nodev()
            .data("mode=1777,strictatime"),
    ]
}

/// Acquire the whole plan on the context's mount stack.
///
/// Stops at the first failure; whatever was mounted stays on the stack for
/// the unwind.
pub fn mount_all(ctx: &mut BuildContext, config: &BuildConfig) -> Result<(), BuildError> {
    let device = ctx
        .device
        .as_ref()
        .filter(|d| d.attached)
        .ok_or_else(|| BuildError::Device(anyhow::anyhow!("no block device is attached")))?;
    let (esp_device, root_device) = match device.partitions.as_slice() {
        [esp, root, ..] => (esp.clone(), root.clone()),
        _ => {
            return Err(BuildError::Device(anyhow::anyhow!(
                "expected an ESP and a root partition on {}",
                device.loop_path.display()
            )))
        }
    };

    let entries = mount_plan(
        &MountPlanInput {
            root: &ctx.root_dir,
            root_device: &root_device,
            esp_device: &esp_device,
            masked_dir: &ctx.masked_dir,
        },
        config,
    );

    let host = ctx.host.clone();
    for entry in entries {
        ctx.mounts
            .acquire(host.as_ref(), entry)
            .map_err(BuildError::Filesystem)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountSource;

    fn plan() -> Vec<MountEntry> {
        mount_plan(
            &MountPlanInput {
                root: Path::new("/scratch/root"),
                root_device: Path::new("/dev/loop7p2"),
                esp_device: Path::new("/dev/loop7p1"),
                masked_dir: Path::new("/scratch/masked"),
            },
            &BuildConfig::default(),
        )
    }

    #[test]
    fn test_plan_order() {
        let targets: Vec<String> = plan()
            .iter()
            .map(|e| e.target.display().to_string())
            .collect();
        assert_eq!(
            targets,
            [
                "/scratch/root",
                "/scratch/root/boot/efi",
                "/scratch/root/proc",
                "/scratch/root/sys",
                "/scratch/root/sys/firmware",
                "/scratch/root/dev",
                "/scratch/root/dev/pts",
                "/scratch/root/dev/shm",
                "/scratch/root/run",
                "/scratch/root/tmp",
            ]
        );
    }

    #[test]
    fn test_root_and_esp_options() {
        let plan = plan();
        assert_eq!(
            plan[0].options.data.as_deref(),
            Some("compress=zstd:1,subvol=@debian")
        );
        assert_eq!(
            plan[0].source,
            MountSource::Device {
                path: PathBuf::from("/dev/loop7p2"),
                fstype: "btrfs".to_string()
            }
        );
        assert_eq!(plan[1].options.data.as_deref(), Some("umask=0077"));
    }

    #[test]
    fn test_firmware_is_masked_read_only() {
        let plan = plan();
        let masked = &plan[4];
        assert!(masked.options.read_only);
        assert_eq!(
            masked.source,
            MountSource::Bind {
                path: PathBuf::from("/scratch/masked")
            }
        );
        // Must come after sys itself.
        assert!(plan[3].target.ends_with("sys"));
    }

    #[test]
    fn test_pseudo_filesystem_flags() {
        let plan = plan();
        let sys = &plan[3];
        assert!(sys.options.read_only && sys.options.nosuid && sys.options.noexec);
        let pts = &plan[6];
        assert_eq!(pts.options.data.as_deref(), Some("mode=0620,gid=5"));
        let tmp = &plan[9];
        assert_eq!(tmp.options.data.as_deref(), Some("mode=1777,strictatime"));
    }
}
