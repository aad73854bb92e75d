//! Converting the finished raw image into a distributable format.

use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::common::{remove_if_exists, write_file_with_dirs};
use crate::context::BuildContext;
use crate::disk::attached_loop_devices;
use crate::error::BuildError;
use crate::host::Host;
use crate::process::Cmd;

/// Output formats `qemu-img` can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Qcow2,
    Vmdk,
    Vdi,
    Vhdx,
    Raw,
}

impl ImageFormat {
    /// Name `qemu-img` uses for `-O` and reports in `info`.
    pub fn qemu_name(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Raw => "raw",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Raw => "img",
            other => other.qemu_name(),
        }
    }

    pub fn supports_compression(self) -> bool {
        self == ImageFormat::Qcow2
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qemu_name())
    }
}

/// The exported artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub format: ImageFormat,
    pub sha256: String,
    pub checksum_path: PathBuf,
}

#[derive(Deserialize)]
struct ImageInfo {
    format: String,
}

/// Convert `raw` to `out` in `format`, verify it and write `<out>.sha256`.
///
/// The raw image must be fully released first: nothing mounted, no device
/// held by the context, and no loop device anywhere still backed by it.
pub fn export(
    ctx: &BuildContext,
    raw: &Path,
    format: ImageFormat,
    out: &Path,
    compress: bool,
) -> Result<ExportReport, BuildError> {
    check_released(ctx, raw, out).map_err(BuildError::Export)?;
    convert(ctx.host.as_ref(), raw, format, out, compress).map_err(BuildError::Export)?;
    verify_format(ctx.host.as_ref(), out, format).map_err(BuildError::Export)?;

    let sha256 = sha256_file(out).map_err(BuildError::Export)?;
    let checksum_path = checksum_path(out);
    let file_name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| out.display().to_string());
    write_file_with_dirs(&checksum_path, format!("{}  {}\n", sha256, file_name))
        .map_err(BuildError::Export)?;

    info!("Exported {} ({}), sha256 {}", out.display(), format, sha256);
    Ok(ExportReport {
        path: out.to_path_buf(),
        format,
        sha256,
        checksum_path,
    })
}

fn check_released(ctx: &BuildContext, raw: &Path, out: &Path) -> Result<()> {
    if let Some(dev) = ctx.device.as_ref().filter(|d| d.attached) {
        bail!(
            "{} is still attached to {}",
            raw.display(),
            dev.loop_path.display()
        );
    }
    if !ctx.mounts.is_empty() {
        bail!("{} mount(s) are still active", ctx.mounts.len());
    }
    let leaked = attached_loop_devices(ctx.host.as_ref(), raw)?;
    if !leaked.is_empty() {
        let names: Vec<String> = leaked.iter().map(|d| d.display().to_string()).collect();
        bail!(
            "{} is still backing loop device(s) {}; run `vmbake detach {}`",
            raw.display(),
            names.join(", "),
            raw.display()
        );
    }
    if !raw.is_file() {
        bail!("raw image {} does not exist", raw.display());
    }
    if is_same_file(raw, out) {
        bail!(
            "refusing to export over the raw image {}",
            raw.display()
        );
    }
    Ok(())
}

/// Equal paths, or two names for one existing file.
fn is_same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `qemu-img convert`, replacing any previous output.
pub fn convert(host: &dyn Host, raw: &Path, format: ImageFormat, out: &Path, compress: bool) -> Result<()> {
    remove_if_exists(out)?;
    remove_if_exists(&checksum_path(out))?;
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut cmd = Cmd::new("qemu-img").args(["convert", "-f", "raw", "-O", format.qemu_name()]);
    if compress && format.supports_compression() {
        cmd = cmd.arg("-c");
    }
    host.run(
        cmd.arg_path(raw)
            .arg_path(out)
            .error_msg("qemu-img convert failed"),
    )?;
    Ok(())
}

/// Ask `qemu-img info` what was written and compare with `expected`.
pub fn verify_format(host: &dyn Host, out: &Path, expected: ImageFormat) -> Result<()> {
    let result = host.run(
        Cmd::new("qemu-img")
            .args(["info", "--output=json"])
            .arg_path(out)
            .error_msg("qemu-img info failed"),
    )?;
    let info: ImageInfo = serde_json::from_str(&result.stdout)
        .with_context(|| format!("Unparseable qemu-img info output for {}", out.display()))?;
    if info.format != expected.qemu_name() {
        return Err(anyhow!(
            "{} reports format '{}', expected '{}'",
            out.display(),
            info.format,
            expected
        ));
    }
    Ok(())
}

/// Lowercase hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// `<out>.sha256`
pub fn checksum_path(out: &Path) -> PathBuf {
    let mut name: OsString = out.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}
