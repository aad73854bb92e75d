//! Sanity checks on a freshly bootstrapped tree.

use anyhow::{bail, Result};
use std::path::Path;
use walkdir::WalkDir;

/// Files that must exist for the tree to be usable as a chroot.
const REQUIRED: &[&str] = &["etc/os-release"];

/// At least one of these must exist.
const SHELLS: &[&str] = &["bin/sh", "usr/bin/sh"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

/// Check the tree has a shell and `etc/os-release`, and measure it.
///
/// The walk stays on the root filesystem, so pseudo-filesystems mounted
/// below it are not counted.
pub fn verify_tree(root: &Path) -> Result<TreeStats> {
    let missing: Vec<&str> = REQUIRED
        .iter()
        .copied()
        .filter(|rel| !root.join(rel).exists())
        .collect();
    if !missing.is_empty() {
        bail!(
            "Bootstrapped tree at {} is missing: {}",
            root.display(),
            missing.join(", ")
        );
    }
    if !SHELLS.iter().any(|rel| root.join(rel).exists()) {
        bail!("Bootstrapped tree at {} has no shell", root.display());
    }

    let mut stats = TreeStats::default();
    for entry in WalkDir::new(root).same_file_system(true) {
        let entry = entry?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata()?.len();
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_counts_files() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::write(tmp.path().join("etc/os-release"), "ID=debian\n").unwrap();
        fs::write(tmp.path().join("bin/sh"), "0123456789").unwrap();

        let stats = verify_tree(tmp.path()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 20);
    }

    #[test]
    fn test_missing_shell() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("etc/os-release"), "ID=debian\n").unwrap();
        let err = verify_tree(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("no shell"));
    }
}
