//! Build environment checks (privileges, loop support, writable paths).

use std::fs;
use std::path::Path;

use nix::unistd::geteuid;

use super::types::CheckResult;
use crate::config::BuildConfig;

const LOOP_CONTROL: &str = "/dev/loop-control";

/// Check the host can run a build of `config`.
pub fn check_build_environment(config: &BuildConfig) -> Vec<CheckResult> {
    let mut results = vec![check_root(), check_loop_control(), check_btrfs_support()];

    let mut dirs = Vec::new();
    for path in [&config.image.raw_path, &config.image.export_path] {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if !dirs.contains(&parent) {
            dirs.push(parent);
        }
    }
    if let Some(ref work) = config.work_dir {
        dirs.push(work.as_path());
    }
    for dir in dirs {
        results.push(check_writable(dir));
    }
    results
}

fn check_root() -> CheckResult {
    let euid = geteuid();
    if euid.is_root() {
        CheckResult::pass("root privileges")
    } else {
        CheckResult::fail(
            "root privileges",
            &format!("euid is {}; loop devices and mounts need root", euid),
        )
    }
}

fn check_loop_control() -> CheckResult {
    if Path::new(LOOP_CONTROL).exists() {
        CheckResult::pass("loop device support")
    } else {
        CheckResult::fail(
            "loop device support",
            &format!("{} missing. Load the 'loop' kernel module.", LOOP_CONTROL),
        )
    }
}

fn check_btrfs_support() -> CheckResult {
    match fs::read_to_string("/proc/filesystems") {
        Ok(list) if list.lines().any(|l| l.split_whitespace().last() == Some("btrfs")) => {
            CheckResult::pass("btrfs support")
        }
        _ => CheckResult::warn(
            "btrfs support",
            "btrfs not listed in /proc/filesystems; the module must load on mount",
        ),
    }
}

/// Check `dir` is writable, creating it if needed.
pub(super) fn check_writable(dir: &Path) -> CheckResult {
    let name = format!("{} writable", dir.display());
    if let Err(e) = fs::create_dir_all(dir) {
        return CheckResult::fail(&name, &format!("Cannot create: {}", e));
    }
    match tempfile::tempfile_in(dir) {
        Ok(_) => CheckResult::pass(&name),
        Err(e) => CheckResult::fail(&name, &format!("Cannot write: {}", e)),
    }
}
