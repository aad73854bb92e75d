//! First-boot files written into the image root.
//!
//! Every function takes the mounted image root and writes relative to it.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::common::{
    append_line_once, remove_if_exists, replace_symlink, write_file_mode, write_file_with_dirs,
};
use crate::config::{BuildConfig, EditorLink, IdentityConfig};

pub const REPART_ROOT_CONF: &str = "[Partition]\nType=root\n";

pub const SSH_HARDENING: &str = "PermitRootLogin no\nPasswordAuthentication no\n";

/// Drop the bootstrap's machine ids so the first boot generates new ones.
pub fn reset_machine_id(root: &Path) -> Result<()> {
    for rel in ["etc/machine-id", "var/lib/dbus/machine-id"] {
        remove_if_exists(&root.join(rel))?;
    }
    Ok(())
}

pub fn write_kernel_cmdline(root: &Path, cmdline: &str) -> Result<()> {
    write_file_with_dirs(root.join("etc/kernel/cmdline"), format!("{}\n", cmdline))
}

/// Let systemd-repart grow the root partition to the disk on first boot.
pub fn write_repart_config(root: &Path) -> Result<()> {
    write_file_with_dirs(root.join("etc/repart.d/50-root.conf"), REPART_ROOT_CONF)
}

/// Root and ESP by filesystem label.
pub fn write_fstab(root: &Path, config: &BuildConfig) -> Result<()> {
    let layout = &config.layout;
    // vfat has no fsck of its own, so it is checked after root (pass 2).
    let content = format!(
        "# /etc/fstab: static file system information.\n\
         # <file system>  <mount point>  <type>  <options>  <dump>  <pass>\n\
         LABEL={}  /  btrfs  {}  0  0\n\
         LABEL={}  /{}  vfat  {}  0  2\n",
        layout.root_label,
        config.root_mount_data(),
        layout.esp_label,
        layout.esp_mount_point.trim_start_matches('/'),
        layout.esp_mount_options,
    );
    write_file_with_dirs(root.join("etc/fstab"), content)
}

/// Hostname, hosts, locale, keymap and timezone.
pub fn write_identity(root: &Path, identity: &IdentityConfig) -> Result<()> {
    let etc = root.join("etc");
    write_file_with_dirs(etc.join("hostname"), format!("{}\n", identity.hostname))?;
    write_file_with_dirs(
        etc.join("hosts"),
        format!(
            "127.0.0.1\tlocalhost\n\
             127.0.1.1\t{}\n\
             ::1\t\tlocalhost ip6-localhost ip6-loopback\n",
            identity.hostname
        ),
    )?;

    let lang = format!("LANG={}\n", identity.locale);
    write_file_with_dirs(etc.join("locale.conf"), &lang)?;
    write_file_with_dirs(etc.join("default/locale"), &lang)?;
    enable_locale(root, &identity.locale)?;

    write_file_with_dirs(etc.join("vconsole.conf"), format!("KEYMAP={}\n", identity.keymap))?;

    replace_symlink(
        &format!("/usr/share/zoneinfo/{}", identity.timezone),
        &etc.join("localtime"),
    )?;
    write_file_with_dirs(etc.join("timezone"), format!("{}\n", identity.timezone))?;
    Ok(())
}

/// Uncomment (or add) the locale in `etc/locale.gen` so `locale-gen` builds it.
fn enable_locale(root: &Path, locale: &str) -> Result<()> {
    let path = root.join("etc/locale.gen");
    let charset = locale.split('.').nth(1).unwrap_or("UTF-8");
    let entry = format!("{} {}", locale, charset);

    let content = fs::read_to_string(&path).unwrap_or_default();
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let bare = line.trim_start_matches('#').trim();
            if bare == entry {
                found = true;
                entry.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(entry);
    }
    write_file_with_dirs(&path, lines.join("\n") + "\n")
}

/// Set root's login shell in `etc/passwd`. The shell must exist in the tree.
pub fn set_root_shell(root: &Path, shell: &str) -> Result<()> {
    if !root.join(shell.trim_start_matches('/')).exists() {
        bail!("Login shell {} does not exist in the image", shell);
    }

    let passwd_path = root.join("etc/passwd");
    let content = fs::read_to_string(&passwd_path)
        .with_context(|| format!("Failed to read {}", passwd_path.display()))?;

    let mut found = false;
    let mut new_lines = Vec::new();
    for line in content.lines() {
        if line.starts_with("root:") {
            let mut fields: Vec<&str> = line.split(':').collect();
            if fields.len() == 7 {
                fields[6] = shell;
                found = true;
                new_lines.push(fields.join(":"));
                continue;
            }
        }
        new_lines.push(line.to_string());
    }
    if !found {
        bail!("No valid root entry in {}", passwd_path.display());
    }

    fs::write(&passwd_path, new_lines.join("\n") + "\n")
        .with_context(|| format!("Failed to write {}", passwd_path.display()))?;
    Ok(())
}

/// DHCP on every interface matching `pattern`, via systemd-networkd.
pub fn write_network_config(root: &Path, pattern: &str) -> Result<()> {
    write_file_with_dirs(
        root.join("etc/systemd/network/80-dhcp.network"),
        format!("[Match]\nName={}\n\n[Network]\nDHCP=yes\n", pattern),
    )
}

pub fn write_ssh_hardening(root: &Path) -> Result<()> {
    write_file_mode(
        root.join("etc/ssh/sshd_config.d/50-hardening.conf"),
        SSH_HARDENING,
        0o644,
    )
}

/// Append each hook line to `etc/bash.bashrc` unless already present.
pub fn append_shell_hooks(root: &Path, hooks: &[String]) -> Result<usize> {
    let bashrc = root.join("etc/bash.bashrc");
    let mut added = 0;
    for hook in hooks {
        if append_line_once(&bashrc, hook)? {
            added += 1;
        }
    }
    Ok(added)
}

pub fn create_editor_links(root: &Path, links: &[EditorLink]) -> Result<()> {
    for link in links {
        replace_symlink(&link.target, &root.join(&link.link))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::populate_minimal_tree;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        populate_minimal_tree(tmp.path(), &[]).unwrap();
        tmp
    }

    fn read(root: &Path, rel: &str) -> String {
        fs::read_to_string(root.join(rel)).unwrap()
    }

    #[test]
    fn test_reset_machine_id() {
        let tmp = tree();
        reset_machine_id(tmp.path()).unwrap();
        assert!(!tmp.path().join("etc/machine-id").exists());
        assert!(!tmp.path().join("var/lib/dbus/machine-id").exists());
        // Already gone is fine.
        reset_machine_id(tmp.path()).unwrap();
    }

    #[test]
    fn test_fstab_by_label() {
        let tmp = tree();
        write_fstab(tmp.path(), &BuildConfig::default()).unwrap();
        let fstab = read(tmp.path(), "etc/fstab");
        assert!(fstab.contains("LABEL=Debian  /  btrfs  compress=zstd:1,subvol=@debian  0  0"));
        assert!(fstab.contains("LABEL=ESP  /boot/efi  vfat  umask=0077  0  2"));
    }

    #[test]
    fn test_identity_files() {
        let tmp = tree();
        let identity = IdentityConfig {
            hostname: "vm1".into(),
            timezone: "Europe/Berlin".into(),
            ..IdentityConfig::default()
        };
        write_identity(tmp.path(), &identity).unwrap();

        assert_eq!(read(tmp.path(), "etc/hostname"), "vm1\n");
        assert!(read(tmp.path(), "etc/hosts").contains("127.0.1.1\tvm1"));
        assert_eq!(read(tmp.path(), "etc/locale.conf"), "LANG=en_US.UTF-8\n");
        assert_eq!(read(tmp.path(), "etc/default/locale"), "LANG=en_US.UTF-8\n");
        assert_eq!(read(tmp.path(), "etc/vconsole.conf"), "KEYMAP=us\n");
        assert_eq!(read(tmp.path(), "etc/timezone"), "Europe/Berlin\n");
        assert_eq!(
            fs::read_link(tmp.path().join("etc/localtime")).unwrap(),
            Path::new("/usr/share/zoneinfo/Europe/Berlin")
        );
        assert!(read(tmp.path(), "etc/locale.gen").contains("en_US.UTF-8 UTF-8"));
    }

    #[test]
    fn test_locale_gen_uncomments_existing_entry() {
        let tmp = tree();
        fs::write(
            tmp.path().join("etc/locale.gen"),
            "# de_DE.UTF-8 UTF-8\n# en_US.UTF-8 UTF-8\n",
        )
        .unwrap();
        enable_locale(tmp.path(), "en_US.UTF-8").unwrap();
        assert_eq!(
            read(tmp.path(), "etc/locale.gen"),
            "# de_DE.UTF-8 UTF-8\nen_US.UTF-8 UTF-8\n"
        );
    }

    #[test]
    fn test_set_root_shell() {
        let tmp = tree();
        set_root_shell(tmp.path(), "/bin/bash").unwrap();
        let passwd = read(tmp.path(), "etc/passwd");
        assert!(passwd.starts_with("root:x:0:0:root:/root:/bin/bash\n"), "{}", passwd);
        assert!(passwd.contains("daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin"));
    }

    #[test]
    fn test_set_root_shell_requires_shell_in_tree() {
        let tmp = tree();
        let err = set_root_shell(tmp.path(), "/usr/bin/zsh").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_network_and_ssh_contents() {
        let tmp = tree();
        write_network_config(tmp.path(), "en*").unwrap();
        write_ssh_hardening(tmp.path()).unwrap();
        assert_eq!(
            read(tmp.path(), "etc/systemd/network/80-dhcp.network"),
            "[Match]\nName=en*\n\n[Network]\nDHCP=yes\n"
        );
        assert_eq!(
            read(tmp.path(), "etc/ssh/sshd_config.d/50-hardening.conf"),
            "PermitRootLogin no\nPasswordAuthentication no\n"
        );
    }

    #[test]
    fn test_shell_hooks_once() {
        let tmp = tree();
        let hooks = vec!["export EDITOR=nvim".to_string()];
        assert_eq!(append_shell_hooks(tmp.path(), &hooks).unwrap(), 1);
        assert_eq!(append_shell_hooks(tmp.path(), &hooks).unwrap(), 0);
        let bashrc = read(tmp.path(), "etc/bash.bashrc");
        assert_eq!(bashrc.matches("export EDITOR=nvim").count(), 1);
    }

    #[test]
    fn test_editor_links_are_absolute_in_image() {
        let tmp = tree();
        create_editor_links(&tmp.path(), &BuildConfig::default().editor_links).unwrap();
        assert_eq!(
            fs::read_link(tmp.path().join("usr/local/bin/vim")).unwrap(),
            Path::new("/usr/bin/nvim")
        );
        assert!(tmp.path().join("usr/local/bin/vi").symlink_metadata().is_ok());
    }
}
