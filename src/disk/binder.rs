//! Backing file, GPT table and loop device lifecycle.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::layout::{partition_node, render_sfdisk_script, PartitionSpec};
use super::BlockDevice;
use crate::config::size::ByteSize;
use crate::config::PartitionWait;
use crate::context::BuildContext;
use crate::error::BuildError;
use crate::host::Host;
use crate::process::Cmd;

/// Create the raw image, partition it and attach it as a loop device.
///
/// The layout is validated first, so an impossible layout leaves nothing
/// behind. The device is recorded on the context the moment `losetup`
/// returns, before the partition wait, so a timeout still gets it detached.
///
/// Returns the partition nodes in table order.
pub fn bind(ctx: &mut BuildContext, wait: &PartitionWait) -> Result<Vec<PathBuf>, BuildError> {
    ctx.spec.validate()?;
    if ctx.device.as_ref().is_some_and(|d| d.attached) {
        return Err(BuildError::Device(anyhow::anyhow!(
            "a block device is already attached to this build"
        )));
    }

    let host = ctx.host.clone();
    let raw = ctx.spec.raw_path.clone();

    // Truncating a file a stale loop device still maps would corrupt both.
    if raw.exists() {
        let leaked = attached_loop_devices(host.as_ref(), &raw).map_err(BuildError::Device)?;
        if !leaked.is_empty() {
            return Err(BuildError::Device(anyhow::anyhow!(
                "{} is still attached to {}; run `vmbake detach {}` first",
                raw.display(),
                leaked[0].display(),
                raw.display()
            )));
        }
    }

    create_sparse_file(&raw, ctx.spec.size).map_err(BuildError::Device)?;
    write_partition_table(host.as_ref(), &raw, &ctx.spec.partitions)
        .map_err(BuildError::Device)?;

    let loop_path = attach(host.as_ref(), &raw).map_err(BuildError::Device)?;
    ctx.device = Some(BlockDevice::attached(loop_path.clone(), raw.clone()));
    info!("Attached {} as {}", raw.display(), loop_path.display());

    let partitions = wait_for_partitions(
        host.as_ref(),
        &loop_path,
        ctx.spec.partitions.len(),
        wait,
    )
    .map_err(BuildError::Device)?;
    if let Some(device) = ctx.device.as_mut() {
        device.partitions = partitions.clone();
    }
    Ok(partitions)
}

/// Detach the loop device. A handle that was never attached, or already
/// detached, is left alone.
pub fn unbind(host: &dyn Host, device: &mut BlockDevice) -> Result<()> {
    if !device.attached {
        return Ok(());
    }
    host.run(
        Cmd::new("losetup")
            .arg("--detach")
            .arg_path(&device.loop_path)
            .error_msg(format!("Failed to detach {}", device.loop_path.display())),
    )?;
    device.attached = false;
    info!("Detached {}", device.loop_path.display());
    Ok(())
}

/// Create (or truncate) a sparse file of exactly `size` bytes.
pub fn create_sparse_file(path: &Path, size: ByteSize) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create image file {}", path.display()))?;
    file.set_len(size.as_bytes())
        .with_context(|| format!("Failed to size {} to {}", path.display(), size))?;
    debug!("Created sparse {} ({})", path.display(), size);
    Ok(())
}

/// Write the GPT described by `partitions` to the raw file.
pub fn write_partition_table(host: &dyn Host, raw: &Path, partitions: &[PartitionSpec]) -> Result<()> {
    let script = render_sfdisk_script(partitions);
    debug!("sfdisk script:\n{}", script);
    host.run(
        Cmd::new("sfdisk")
            .arg("--quiet")
            .arg_path(raw)
            .stdin(script)
            .error_msg("sfdisk failed to create partition table"),
    )?;
    Ok(())
}

/// `losetup --find --show --partscan`, returning the device path.
pub fn attach(host: &dyn Host, raw: &Path) -> Result<PathBuf> {
    let out = host.run(
        Cmd::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg_path(raw)
            .error_msg(format!("Failed to attach {}", raw.display())),
    )?;
    let dev = out.stdout_trimmed();
    if !dev.starts_with("/dev/loop") {
        bail!("losetup returned unexpected device '{}'", dev);
    }
    Ok(PathBuf::from(dev))
}

/// Wait until all `count` partition nodes of `loop_path` exist.
pub fn wait_for_partitions(
    host: &dyn Host,
    loop_path: &Path,
    count: usize,
    wait: &PartitionWait,
) -> Result<Vec<PathBuf>> {
    let nodes: Vec<PathBuf> = (0..count).map(|i| partition_node(loop_path, i)).collect();

    for attempt in 0..wait.retries {
        if nodes.iter().all(|n| host.device_ready(n)) {
            debug!("partition nodes ready after {} attempt(s)", attempt + 1);
            return Ok(nodes);
        }
        thread::sleep(wait.backoff());
    }

    let missing: Vec<String> = nodes
        .iter()
        .filter(|n| !host.device_ready(n))
        .map(|n| n.display().to_string())
        .collect();
    bail!(
        "Timed out after {} x {}ms waiting for partition nodes: {}",
        wait.retries,
        wait.backoff_ms,
        missing.join(", ")
    )
}

/// Loop devices currently backed by `raw`.
pub fn attached_loop_devices(host: &dyn Host, raw: &Path) -> Result<Vec<PathBuf>> {
    let out = host.run(
        Cmd::new("losetup")
            .arg("--associated")
            .arg_path(raw)
            .error_msg(format!("Failed to list loop devices for {}", raw.display())),
    )?;
    // "/dev/loop7: [2049]:1234 (/path/to/debian.raw)"
    Ok(out
        .stdout
        .lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|dev| dev.starts_with("/dev/loop"))
        .map(PathBuf::from)
        .collect())
}

/// Detach every loop device still backed by `raw`. Used to clean up after a
/// build that was killed before it could unwind.
pub fn detach_all(host: &dyn Host, raw: &Path) -> Result<Vec<PathBuf>> {
    let devices = attached_loop_devices(host, raw)?;
    for dev in &devices {
        let mut handle = BlockDevice::attached(dev.clone(), raw.to_path_buf());
        unbind(host, &mut handle)?;
    }
    Ok(devices)
}
