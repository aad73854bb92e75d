//! Host tool availability checks.

use super::types::CheckResult;

/// Tools the build runs, with the Debian package that ships each.
pub const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("sfdisk", "fdisk", "Writes the GPT partition table"),
    ("losetup", "mount", "Attaches the raw image as a loop device"),
    ("mkfs.vfat", "dosfstools", "Formats the EFI system partition"),
    ("mkfs.btrfs", "btrfs-progs", "Formats the root partition"),
    ("btrfs", "btrfs-progs", "Creates the root sub-volume"),
    ("debootstrap", "debootstrap", "Bootstraps the root filesystem"),
    ("chroot", "coreutils", "Installs packages inside the image"),
    ("qemu-img", "qemu-utils", "Converts and verifies the exported image"),
];

/// Check every required tool is on PATH.
pub fn check_host_tools() -> Vec<CheckResult> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, package, purpose)| check_tool_exists(tool, package, purpose))
        .collect()
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str) -> CheckResult {
    match which::which(tool) {
        Ok(path) => CheckResult::pass_with(tool, &path.display().to_string()),
        Err(_) => CheckResult::fail(
            tool,
            &format!("Not found. Install the '{}' package. {}", package, purpose),
        ),
    }
}
