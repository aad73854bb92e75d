//! Scratch directories for a build.

use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Create a fresh, uniquely named directory under `parent` that outlives
/// this call. The caller owns its removal.
pub fn create_scratch_dir(parent: &Path, prefix: &str) -> Result<PathBuf> {
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let dir = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in(parent)
        .with_context(|| format!("Failed to create scratch dir in {}", parent.display()))?;
    Ok(dir.keep())
}

/// Remove an empty directory.
///
/// Never recursive: a directory that still has something mounted on or
/// written into it is left alone and reported. A missing directory is fine.
pub fn remove_empty_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}
