//! Populating the image root: bootstrap, then packages inside a chroot.

mod verify;

pub use verify::{verify_tree, TreeStats};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::common::{remove_if_exists, write_file_mode};
use crate::config::DistroConfig;
use crate::error::BuildError;
use crate::host::Host;
use crate::process::Cmd;

/// Relative path of the invoke-rc.d policy hook inside the image.
pub const POLICY_RC_D: &str = "usr/sbin/policy-rc.d";

/// Exit 101 tells invoke-rc.d the action is forbidden, so package scripts
/// don't start daemons inside the chroot.
const POLICY_RC_D_SCRIPT: &str = "#!/bin/sh\nexit 101\n";

/// Run debootstrap into `target` and check the result looks like a system.
///
/// No retry: a failed bootstrap fails the build.
pub fn bootstrap(host: &dyn Host, target: &Path, distro: &DistroConfig) -> Result<TreeStats, BuildError> {
    info!(
        "Bootstrapping {} from {} into {}",
        distro.release,
        distro.mirror,
        target.display()
    );

    let mut cmd = Cmd::new("debootstrap").arg(format!("--variant={}", distro.variant));
    if !distro.components.is_empty() {
        cmd = cmd.arg(format!("--components={}", distro.components.join(",")));
    }
    let cmd = cmd
        .arg(&distro.release)
        .arg_path(target)
        .arg(&distro.mirror)
        .interactive()
        .error_msg(format!("debootstrap of '{}' failed", distro.release));
    host.run(cmd).map_err(BuildError::Bootstrap)?;

    let stats = verify_tree(target).map_err(BuildError::Bootstrap)?;
    info!(
        "Bootstrapped tree: {} files, {:.1} MiB",
        stats.files,
        stats.bytes as f64 / (1024.0 * 1024.0)
    );
    Ok(stats)
}

/// Install `packages` with apt-get inside a chroot of `target`.
///
/// Services are kept from starting for the duration via `policy-rc.d`,
/// which is removed again however the install ends. An empty set does
/// nothing.
pub fn install_packages(host: &dyn Host, target: &Path, packages: &BTreeSet<String>) -> Result<(), BuildError> {
    if packages.is_empty() {
        debug!("no packages to install");
        return Ok(());
    }
    if !target.join("bin/sh").exists() {
        return Err(BuildError::Bootstrap(anyhow!(
            "cannot enter chroot: {} has no /bin/sh",
            target.display()
        )));
    }

    let _policy = PolicyRcGuard::install(target).map_err(BuildError::Bootstrap)?;

    host.run(
        apt_get(target)
            .arg("update")
            .error_msg("apt-get update failed inside the chroot"),
    )
    .map_err(BuildError::Bootstrap)?;

    info!("Installing {} packages", packages.len());
    host.run(
        apt_get(target)
            .args(["install", "-y", "--no-install-recommends"])
            .args(packages)
            .error_msg("apt-get install failed inside the chroot"),
    )
    .map_err(BuildError::Bootstrap)?;
    Ok(())
}

fn apt_get(target: &Path) -> Cmd {
    Cmd::new("chroot")
        .arg_path(target)
        .arg("apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("LC_ALL", "C.UTF-8")
        .interactive()
}

/// Holds a `policy-rc.d` in place until dropped.
struct PolicyRcGuard {
    path: PathBuf,
}

impl PolicyRcGuard {
    fn install(root: &Path) -> anyhow::Result<Self> {
        let path = root.join(POLICY_RC_D);
        write_file_mode(&path, POLICY_RC_D_SCRIPT, 0o755)?;
        Ok(Self { path })
    }
}

impl Drop for PolicyRcGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_if_exists(&self.path) {
            warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{populate_minimal_tree, RecordingHost};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn packages(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bootstrap_command_line() {
        let tmp = TempDir::new().unwrap();
        let host = RecordingHost::new();
        host.simulate_debootstrap(&[]);
        let distro = DistroConfig {
            components: vec!["main".into(), "contrib".into()],
            ..DistroConfig::default()
        };

        let stats = bootstrap(&host, tmp.path(), &distro).unwrap();
        assert!(stats.files > 0);
        assert_eq!(
            host.commands(),
            vec![format!(
                "debootstrap --variant=minbase --components=main,contrib trixie {} http://deb.debian.org/debian",
                tmp.path().display()
            )]
        );
    }

    #[test]
    fn test_bootstrap_failure_is_bootstrap_error() {
        let tmp = TempDir::new().unwrap();
        let host = RecordingHost::new();
        host.fail_command("debootstrap");
        let err = bootstrap(&host, tmp.path(), &DistroConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "BootstrapError");
    }

    #[test]
    fn test_empty_tree_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let host = RecordingHost::new();
        let err = bootstrap(&host, tmp.path(), &DistroConfig::default()).unwrap_err();
        assert!(err.to_string().contains("os-release") || err.to_string().contains("shell"));
    }

    #[test]
    fn test_install_sorted_with_policy_during_run() {
        let tmp = TempDir::new().unwrap();
        populate_minimal_tree(tmp.path(), &[]).unwrap();
        let host = RecordingHost::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let policy = tmp.path().join(POLICY_RC_D);
        let seen_hook = seen.clone();
        host.on_run("chroot", move |_| {
            seen_hook.lock().unwrap().push(policy.exists());
            Ok(())
        });

        install_packages(&host, tmp.path(), &packages(&["sudo", "btrfs-progs", "neovim"])).unwrap();

        let cmds = host.commands();
        assert_eq!(cmds.len(), 2);
        assert!(cmds[0].ends_with("apt-get update"));
        assert!(cmds[1].ends_with(
            "apt-get install -y --no-install-recommends btrfs-progs neovim sudo"
        ));
        assert_eq!(*seen.lock().unwrap(), vec![true, true]);
        assert!(!tmp.path().join(POLICY_RC_D).exists());
    }

    #[test]
    fn test_policy_removed_on_failure() {
        let tmp = TempDir::new().unwrap();
        populate_minimal_tree(tmp.path(), &[]).unwrap();
        let host = RecordingHost::new();
        host.fail_command("no-such-package");

        let err = install_packages(&host, tmp.path(), &packages(&["no-such-package"])).unwrap_err();
        assert_eq!(err.kind(), "BootstrapError");
        assert!(!tmp.path().join(POLICY_RC_D).exists());
    }

    #[test]
    fn test_empty_package_set_is_noop() {
        let tmp = TempDir::new().unwrap();
        let host = RecordingHost::new();
        install_packages(&host, tmp.path(), &BTreeSet::new()).unwrap();
        assert!(host.commands().is_empty());
    }

    #[test]
    fn test_missing_shell_blocks_chroot() {
        let tmp = TempDir::new().unwrap();
        let host = RecordingHost::new();
        let err = install_packages(&host, tmp.path(), &packages(&["sudo"])).unwrap_err();
        assert!(err.to_string().contains("/bin/sh"));
        assert!(host.commands().is_empty());
    }
}
