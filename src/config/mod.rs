//! Build configuration for vmbake.
//!
//! A [`BuildConfig`] is read from JSON (every field optional, Debian
//! defaults), then overridden by `VMBAKE_*` environment variables, then by
//! CLI flags. A `.env` file is loaded into the environment by `main` before
//! any of this runs.

pub mod size;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::disk::layout::{
    ImageSpec, PartitionAttribute, PartitionSpec, ESP_TYPE_GUID, ROOT_X86_64_TYPE_GUID,
};
use crate::error::BuildError;
use crate::export::ImageFormat;
use size::ByteSize;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "VMBAKE_CONFIG";

/// Longest label a FAT filesystem accepts.
pub const FAT_LABEL_MAX: usize = 11;

/// Complete description of the image to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    pub image: ImageConfig,
    pub distro: DistroConfig,
    pub layout: LayoutConfig,
    pub identity: IdentityConfig,
    pub kernel: KernelConfig,
    pub network: NetworkConfig,
    pub packages: BTreeSet<String>,
    pub services: BTreeSet<String>,
    /// Lines appended once each to `etc/bash.bashrc`.
    pub shell_hooks: Vec<String>,
    pub editor_links: Vec<EditorLink>,
    /// Parent directory for the scratch mount point. Defaults to the system
    /// temp dir.
    pub work_dir: Option<PathBuf>,
    pub partition_wait: PartitionWait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageConfig {
    pub size: ByteSize,
    pub raw_path: PathBuf,
    pub export_path: PathBuf,
    pub export_format: ImageFormat,
    /// Compress qcow2 output.
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistroConfig {
    pub release: String,
    pub mirror: String,
    pub variant: String,
    pub components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    pub esp_size: ByteSize,
    pub esp_label: String,
    pub esp_type_guid: String,
    /// Relative to the root mount.
    pub esp_mount_point: String,
    pub esp_mount_options: String,
    pub root_label: String,
    pub root_type_guid: String,
    pub root_subvolume: String,
    /// btrfs options besides `subvol=`, which is added from `root_subvolume`.
    pub root_mount_options: String,
    /// Flag the root partition for growth on first boot.
    pub auto_grow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    pub hostname: String,
    pub keymap: String,
    pub locale: String,
    pub timezone: String,
    /// Login shell for root; must exist in the bootstrapped tree.
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// Console and diagnostic parameters appended after `rw`.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// systemd-networkd `[Match] Name=` pattern.
    pub interface_pattern: String,
}

/// A symlink created inside the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditorLink {
    /// Relative to the image root, e.g. `usr/local/bin/vim`.
    pub link: String,
    /// Absolute in-image path, e.g. `/usr/bin/nvim`.
    pub target: String,
}

/// Bounded wait for partition nodes after `losetup --partscan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartitionWait {
    pub retries: u32,
    pub backoff_ms: u64,
}

impl PartitionWait {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            size: ByteSize::gib(2),
            raw_path: PathBuf::from("output/debian.raw"),
            export_path: PathBuf::from("output/debian.qcow2"),
            export_format: ImageFormat::Qcow2,
            compress: true,
        }
    }
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            release: "trixie".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
            variant: "minbase".to_string(),
            components: Vec::new(),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            esp_size: ByteSize::mib(200),
            esp_label: "ESP".to_string(),
            esp_type_guid: ESP_TYPE_GUID.to_string(),
            esp_mount_point: "boot/efi".to_string(),
            esp_mount_options: "umask=0077".to_string(),
            root_label: "Debian".to_string(),
            root_type_guid: ROOT_X86_64_TYPE_GUID.to_string(),
            root_subvolume: "@debian".to_string(),
            root_mount_options: "compress=zstd:1".to_string(),
            auto_grow: true,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            hostname: "debian".to_string(),
            keymap: "us".to_string(),
            locale: "en_US.UTF-8".to_string(),
            timezone: "UTC".to_string(),
            shell: "/bin/bash".to_string(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            params: vec![
                "console=tty0".to_string(),
                "console=ttyS0,115200n8".to_string(),
                "systemd.show_status=auto".to_string(),
            ],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface_pattern: "en*".to_string(),
        }
    }
}

impl Default for PartitionWait {
    fn default() -> Self {
        Self {
            retries: 50,
            backoff_ms: 100,
        }
    }
}

/// Packages installed into the chroot after bootstrap.
const DEFAULT_PACKAGES: &[&str] = &[
    "linux-image-amd64",
    "systemd",
    "systemd-sysv",
    "systemd-boot",
    "systemd-resolved",
    "systemd-repart",
    "systemd-timesyncd",
    "dbus",
    "btrfs-progs",
    "dosfstools",
    "openssh-server",
    "sudo",
    "bash-completion",
    "neovim",
    "fzf",
    "ca-certificates",
    "locales",
];

/// Units enabled at boot.
const DEFAULT_SERVICES: &[&str] = &[
    "systemd-networkd",
    "systemd-resolved",
    "ssh",
    "systemd-timesyncd",
];

const DEFAULT_SHELL_HOOKS: &[&str] = &[
    "[ -f /usr/share/doc/fzf/examples/key-bindings.bash ] && . /usr/share/doc/fzf/examples/key-bindings.bash",
    "export EDITOR=nvim",
];

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: ImageConfig::default(),
            distro: DistroConfig::default(),
            layout: LayoutConfig::default(),
            identity: IdentityConfig::default(),
            kernel: KernelConfig::default(),
            network: NetworkConfig::default(),
            packages: DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect(),
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            shell_hooks: DEFAULT_SHELL_HOOKS.iter().map(|s| s.to_string()).collect(),
            editor_links: ["vim", "vi"]
                .iter()
                .map(|name| EditorLink {
                    link: format!("usr/local/bin/{}", name),
                    target: "/usr/bin/nvim".to_string(),
                })
                .collect(),
            work_dir: None,
            partition_wait: PartitionWait::default(),
        }
    }
}

impl BuildConfig {
    /// Load configuration from the first file found, then apply environment
    /// overrides.
    ///
    /// Lookup order:
    /// 1. `explicit` (`--config`)
    /// 2. `$VMBAKE_CONFIG`
    /// 3. `<config dir>/vmbake/config.json`, if it exists
    /// 4. built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        let mut config = match Self::config_path(explicit, lookup) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Resolve which config file (if any) to read.
    pub fn config_path<F>(explicit: Option<&Path>, lookup: F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Some(path) = lookup(CONFIG_ENV).filter(|s| !s.is_empty()) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("vmbake").join("config.json"))
            .filter(|path| path.is_file())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply `VMBAKE_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("VMBAKE_RELEASE") {
            self.distro.release = v;
        }
        if let Some(v) = get("VMBAKE_MIRROR") {
            self.distro.mirror = v;
        }
        if let Some(v) = get("VMBAKE_SIZE") {
            self.image.size = v
                .parse()
                .with_context(|| format!("Invalid VMBAKE_SIZE '{}'", v))?;
        }
        if let Some(v) = get("VMBAKE_RAW_PATH") {
            self.image.raw_path = PathBuf::from(v);
        }
        if let Some(v) = get("VMBAKE_EXPORT_PATH") {
            self.image.export_path = PathBuf::from(v);
        }
        if let Some(v) = get("VMBAKE_HOSTNAME") {
            self.identity.hostname = v;
        }
        Ok(())
    }

    /// Check everything the build depends on before anything is created.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.distro.release.trim().is_empty() {
            return Err(BuildError::config("distro release is empty"));
        }
        if self.distro.mirror.trim().is_empty() {
            return Err(BuildError::config("distro mirror is empty"));
        }
        if self.layout.esp_label.len() > FAT_LABEL_MAX || !self.layout.esp_label.is_ascii() {
            return Err(BuildError::config(format!(
                "ESP label '{}' must be at most {} ASCII characters",
                self.layout.esp_label, FAT_LABEL_MAX
            )));
        }
        let subvol = &self.layout.root_subvolume;
        if subvol.is_empty() || subvol.contains('/') || subvol.contains(',') {
            return Err(BuildError::config(format!(
                "invalid root sub-volume name '{}'",
                subvol
            )));
        }
        if !is_valid_hostname(&self.identity.hostname) {
            return Err(BuildError::config(format!(
                "invalid hostname '{}'",
                self.identity.hostname
            )));
        }
        if !self.identity.shell.starts_with('/') {
            return Err(BuildError::config(format!(
                "root shell '{}' must be an absolute path",
                self.identity.shell
            )));
        }
        if self.image.export_path == self.image.raw_path {
            return Err(BuildError::config(format!(
                "export path {} is the raw image itself",
                self.image.raw_path.display()
            )));
        }
        if self.partition_wait.retries == 0 {
            return Err(BuildError::config("partition_wait.retries must be positive"));
        }
        for link in &self.editor_links {
            if link.link.starts_with('/') || link.link.split('/').any(|c| c == "..") {
                return Err(BuildError::config(format!(
                    "editor link '{}' must be relative to the image root",
                    link.link
                )));
            }
        }
        self.image_spec().validate()
    }

    /// Image and partition table derived from this config.
    pub fn image_spec(&self) -> ImageSpec {
        let layout = &self.layout;
        let esp = PartitionSpec::fixed(&layout.esp_type_guid, &layout.esp_label, layout.esp_size);
        let mut root = PartitionSpec::grow(&layout.root_type_guid, &layout.root_label);
        if layout.auto_grow {
            root = root.with_attribute(PartitionAttribute::GrowFileSystem);
        }
        ImageSpec {
            size: self.image.size,
            raw_path: self.image.raw_path.clone(),
            export_format: self.image.export_format,
            export_path: self.image.export_path.clone(),
            partitions: vec![esp, root],
        }
    }

    /// btrfs mount data for the root: the configured options plus `subvol=`.
    pub fn root_mount_data(&self) -> String {
        let opts = self.layout.root_mount_options.trim_matches(',');
        let subvol = format!("subvol={}", self.layout.root_subvolume);
        if opts.is_empty() {
            subvol
        } else {
            format!("{},{}", opts, subvol)
        }
    }

    /// Kernel command line written to `etc/kernel/cmdline`.
    pub fn kernel_cmdline(&self) -> String {
        let mut parts = vec![
            format!("root=LABEL={}", self.layout.root_label),
            format!("rootflags={}", self.root_mount_data()),
            "rw".to_string(),
        ];
        parts.extend(self.kernel.params.iter().cloned());
        parts.join(" ")
    }

    /// Print configuration for `vmbake show config`.
    pub fn print(&self) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(self)?);
        Ok(())
    }
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = BuildConfig::default();
        config.validate().unwrap();
        assert_eq!(config.distro.release, "trixie");
        assert!(config.packages.contains("linux-image-amd64"));
        assert!(config.services.contains("ssh"));
    }

    #[test]
    fn test_default_kernel_cmdline() {
        assert_eq!(
            BuildConfig::default().kernel_cmdline(),
            "root=LABEL=Debian rootflags=compress=zstd:1,subvol=@debian rw \
             console=tty0 console=ttyS0,115200n8 systemd.show_status=auto"
        );
    }

    #[test]
    fn test_root_mount_data_without_extra_options() {
        let mut config = BuildConfig::default();
        config.layout.root_mount_options = String::new();
        assert_eq!(config.root_mount_data(), "subvol=@debian");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: BuildConfig = serde_json::from_str(
            r#"{ "image": { "size": "4G" }, "identity": { "hostname": "vm1" } }"#,
        )
        .unwrap();
        assert_eq!(config.image.size, ByteSize::gib(4));
        assert_eq!(config.identity.hostname, "vm1");
        assert_eq!(config.identity.locale, "en_US.UTF-8");
        assert_eq!(config.layout.esp_size, ByteSize::mib(200));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<BuildConfig, _> = serde_json::from_str(r#"{ "imgae": {} }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BuildConfig::default();
        config
            .apply_env(env(&[
                ("VMBAKE_RELEASE", "bookworm"),
                ("VMBAKE_SIZE", "8G"),
                ("VMBAKE_HOSTNAME", "builder"),
                ("VMBAKE_MIRROR", ""),
            ]))
            .unwrap();
        assert_eq!(config.distro.release, "bookworm");
        assert_eq!(config.image.size, ByteSize::gib(8));
        assert_eq!(config.identity.hostname, "builder");
        // Empty values do not override.
        assert_eq!(config.distro.mirror, "http://deb.debian.org/debian");
    }

    #[test]
    fn test_env_invalid_size() {
        let mut config = BuildConfig::default();
        let err = config
            .apply_env(env(&[("VMBAKE_SIZE", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("VMBAKE_SIZE"));
    }

    #[test]
    fn test_config_path_prefers_explicit_then_env() {
        let explicit = Path::new("/etc/vmbake.json");
        let lookup = env(&[(CONFIG_ENV, "/srv/from-env.json")]);
        assert_eq!(
            BuildConfig::config_path(Some(explicit), &lookup),
            Some(explicit.to_path_buf())
        );
        assert_eq!(
            BuildConfig::config_path(None, &lookup),
            Some(PathBuf::from("/srv/from-env.json"))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "distro": { "release": "bookworm" } }"#).unwrap();
        let config = BuildConfig::from_file(&path).unwrap();
        assert_eq!(config.distro.release, "bookworm");

        fs::write(&path, "{ not json").unwrap();
        let err = BuildConfig::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse"));
    }

    #[test]
    fn test_validate_rejects_long_esp_label() {
        let mut config = BuildConfig::default();
        config.layout.esp_label = "EFI-SYSTEM-PART".to_string();
        assert_eq!(config.validate().unwrap_err().kind(), "ConfigError");
    }

    #[test]
    fn test_validate_rejects_export_over_raw() {
        let mut config = BuildConfig::default();
        config.image.export_path = config.image.raw_path.clone();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("raw image itself"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_quoted_root_label() {
        let mut config = BuildConfig::default();
        config.layout.root_label = "My \"Root\"".to_string();
        assert_eq!(config.validate().unwrap_err().kind(), "ConfigError");
    }

    #[test]
    fn test_validate_rejects_bad_hostname_and_subvolume() {
        let mut config = BuildConfig::default();
        config.identity.hostname = "bad host".to_string();
        assert!(config.validate().is_err());

        let mut config = BuildConfig::default();
        config.layout.root_subvolume = "a/b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_undersized_image() {
        let mut config = BuildConfig::default();
        config.image.size = ByteSize::mib(202);
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn test_image_spec_layout() {
        let spec = BuildConfig::default().image_spec();
        assert_eq!(spec.partitions.len(), 2);
        assert_eq!(spec.partitions[0].label, "ESP");
        assert_eq!(spec.partitions[1].label, "Debian");
        assert!(spec.partitions[1].auto_grows());
        assert_eq!(spec.export_format, ImageFormat::Qcow2);
    }
}
