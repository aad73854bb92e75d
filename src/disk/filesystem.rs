//! Formatting the ESP and the btrfs root.

use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::config::{LayoutConfig, FAT_LABEL_MAX};
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::host::Host;
use crate::mount::MountEntry;
use crate::process::Cmd;

/// Format both partitions of a bound context: ESP first, then root.
pub fn provision(ctx: &mut BuildContext, layout: &LayoutConfig) -> Result<(), BuildError> {
    let partitions = ctx
        .device
        .as_ref()
        .filter(|d| d.attached)
        .map(|d| d.partitions.clone())
        .ok_or_else(|| BuildError::Device(anyhow::anyhow!("no block device is attached")))?;
    let [esp, root] = partitions.as_slice() else {
        return Err(BuildError::Device(anyhow::anyhow!(
            "expected 2 partitions, found {}",
            partitions.len()
        )));
    };

    format_esp(ctx.host.as_ref(), esp, &layout.esp_label)?;
    format_root(ctx, root, &layout.root_label, &layout.root_subvolume)
}

/// FAT32 with the given volume label.
pub fn format_esp(host: &dyn Host, device: &Path, label: &str) -> Result<(), BuildError> {
    if label.is_empty() || label.len() > FAT_LABEL_MAX {
        return Err(BuildError::config(format!(
            "FAT label '{}' must be 1 to {} characters",
            label, FAT_LABEL_MAX
        )));
    }
    host.run(
        Cmd::new("mkfs.vfat")
            .args(["-F", "32", "-n", label])
            .arg_path(device)
            .error_msg(format!("mkfs.vfat failed on {}", device.display())),
    )
    .map_err(BuildError::Filesystem)?;
    info!("Formatted {} as FAT32 ({})", device.display(), label);
    Ok(())
}

/// btrfs with `subvolume` created and made the default.
///
/// The top-level volume is mounted on the context's scratch root through
/// its mount stack, so a failure between mount and release still gets it
/// unmounted by the unwind.
pub fn format_root(
    ctx: &mut BuildContext,
    device: &Path,
    label: &str,
    subvolume: &str,
) -> Result<(), BuildError> {
    let host = ctx.host.clone();
    host.run(
        Cmd::new("mkfs.btrfs")
            .args(["-f", "-L", label])
            .arg_path(device)
            .error_msg(format!("mkfs.btrfs failed on {}", device.display())),
    )
    .map_err(BuildError::Filesystem)?;

    let depth = ctx.mounts.len();
    let top = ctx.root_dir.clone();
    ctx.mounts
        .acquire(host.as_ref(), MountEntry::device(top.clone(), device, "btrfs"))
        .map_err(BuildError::Filesystem)?;

    let subvol_path = top.join(subvolume);
    host.run(
        Cmd::new("btrfs")
            .args(["subvolume", "create"])
            .arg_path(&subvol_path),
    )
    .context("Failed to create root sub-volume")
    .map_err(BuildError::Filesystem)?;
    host.run(
        Cmd::new("btrfs")
            .args(["subvolume", "set-default"])
            .arg_path(&subvol_path),
    )
    .context("Failed to make the root sub-volume the default")
    .map_err(BuildError::Filesystem)?;

    ctx.mounts
        .release_to(host.as_ref(), depth)
        .map_err(|e| BuildError::Filesystem(e.into()))?;
    info!(
        "Formatted {} as btrfs ({}) with default sub-volume {}",
        device.display(),
        label,
        subvolume
    );
    Ok(())
}
