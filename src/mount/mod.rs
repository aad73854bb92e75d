//! Ordered mounts with strict reverse-order release.
//!
//! The stack only ever holds mounts that succeeded. Release pops from the
//! top, so nested mounts (ESP under root, `dev/pts` under `dev`) always go
//! before their parents.

pub mod plan;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::MsFlags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::host::{Host, Unmounted};

/// What gets mounted at a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    /// A block device with a filesystem type.
    Device { path: PathBuf, fstype: String },
    /// A kernel pseudo-filesystem (`proc`, `sysfs`, `tmpfs`...). The type
    /// doubles as the source name.
    Pseudo { fstype: String },
    /// A bind mount of a host directory.
    Bind { path: PathBuf },
}

impl fmt::Display for MountSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountSource::Device { path, fstype } => write!(f, "{} ({})", path.display(), fstype),
            MountSource::Pseudo { fstype } => f.write_str(fstype),
            MountSource::Bind { path } => write!(f, "bind:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
    pub nosuid: bool,
    pub nodev: bool,
    pub noexec: bool,
    /// Filesystem-specific data, e.g. `compress=zstd:1,subvol=@debian`.
    pub data: Option<String>,
}

impl MountOptions {
    pub fn flags(&self) -> MsFlags {
        let mut flags = MsFlags::empty();
        if self.read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        if self.nosuid {
            flags |= MsFlags::MS_NOSUID;
        }
        if self.nodev {
            flags |= MsFlags::MS_NODEV;
        }
        if self.noexec {
            flags |= MsFlags::MS_NOEXEC;
        }
        flags
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<&str> = Vec::new();
        parts.push(if self.read_only { "ro" } else { "rw" });
        if self.nosuid {
            parts.push("nosuid");
        }
        if self.nodev {
            parts.push("nodev");
        }
        if self.noexec {
            parts.push("noexec");
        }
        if let Some(ref data) = self.data {
            parts.push(data);
        }
        f.write_str(&parts.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub target: PathBuf,
    pub source: MountSource,
    pub options: MountOptions,
    pub acquired: bool,
}

impl MountEntry {
    pub fn device(target: impl Into<PathBuf>, device: &Path, fstype: &str) -> Self {
        Self::new(
            target,
            MountSource::Device {
                path: device.to_path_buf(),
                fstype: fstype.to_string(),
            },
        )
    }

    pub fn pseudo(target: impl Into<PathBuf>, fstype: &str) -> Self {
        Self::new(
            target,
            MountSource::Pseudo {
                fstype: fstype.to_string(),
            },
        )
    }

    pub fn bind(target: impl Into<PathBuf>, source: &Path) -> Self {
        Self::new(
            target,
            MountSource::Bind {
                path: source.to_path_buf(),
            },
        )
    }

    fn new(target: impl Into<PathBuf>, source: MountSource) -> Self {
        Self {
            target: target.into(),
            source,
            options: MountOptions::default(),
            acquired: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.options.read_only = true;
        self
    }

    pub fn nosuid(mut self) -> Self {
        self.options.nosuid = true;
        self
    }

    pub fn nodev(mut self) -> Self {
        self.options.nodev = true;
        self
    }

    pub fn noexec(mut self) -> Self {
        self.options.noexec = true;
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        let data = data.into();
        self.options.data = if data.is_empty() { None } else { Some(data) };
        self
    }
}

/// Unmount failures collected during one release.
#[derive(Debug, Error)]
#[error("{} mount(s) could not be released: {}", .failures.len(), summarize(.failures))]
pub struct ReleaseErrors {
    pub failures: Vec<(PathBuf, anyhow::Error)>,
}

fn summarize(failures: &[(PathBuf, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(target, err)| format!("{}: {:#}", target.display(), err))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Default)]
pub struct MountStack {
    entries: Vec<MountEntry>,
}

impl MountStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the target directory, mount, and push on success.
    pub fn acquire(&mut self, host: &dyn Host, mut entry: MountEntry) -> Result<()> {
        fs::create_dir_all(&entry.target).with_context(|| {
            format!("Failed to create mount point {}", entry.target.display())
        })?;
        host.mount(&entry).with_context(|| {
            format!(
                "Failed to mount {} on {}",
                entry.source,
                entry.target.display()
            )
        })?;
        debug!(
            "mounted {} on {} ({})",
            entry.source,
            entry.target.display(),
            entry.options
        );
        entry.acquired = true;
        self.entries.push(entry);
        Ok(())
    }

    /// Release every mount, newest first.
    pub fn release(&mut self, host: &dyn Host) -> Result<(), ReleaseErrors> {
        self.release_to(host, 0)
    }

    /// Release mounts until only the bottom `depth` remain.
    ///
    /// Each popped entry gets exactly one unmount attempt. Failures are
    /// collected and the rest of the stack is still released.
    pub fn release_to(&mut self, host: &dyn Host, depth: usize) -> Result<(), ReleaseErrors> {
        let mut failures = Vec::new();
        while self.entries.len() > depth {
            let Some(mut entry) = self.entries.pop() else {
                break;
            };
            match host.unmount(&entry.target) {
                Ok(Unmounted::Released) => {
                    debug!("unmounted {}", entry.target.display());
                }
                Ok(Unmounted::Lazy) => {
                    warn!(
                        "{} was busy, lazily detached",
                        entry.target.display()
                    );
                }
                Ok(Unmounted::NotMounted) => {
                    debug!("{} was already unmounted", entry.target.display());
                }
                Err(e) => {
                    warn!("failed to unmount {}: {:#}", entry.target.display(), e);
                    failures.push((entry.target.clone(), e));
                }
            }
            entry.acquired = false;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ReleaseErrors { failures })
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MountEntry] {
        &self.entries
    }

    /// Mount targets, bottom first.
    pub fn targets(&self) -> Vec<PathBuf> {
        self.entries.iter().map(|e| e.target.clone()).collect()
    }
}
