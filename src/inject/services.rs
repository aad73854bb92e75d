//! Offline `systemctl enable`: symlinks driven by each unit's `[Install]`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::common::replace_symlink;

/// Where unit files are looked up, in priority order.
const UNIT_DIRS: &[&str] = &[
    "etc/systemd/system",
    "usr/lib/systemd/system",
    "lib/systemd/system",
];

/// The `[Install]` section of a unit file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallSection {
    pub wanted_by: Vec<String>,
    pub required_by: Vec<String>,
    pub alias: Vec<String>,
}

impl InstallSection {
    /// Nothing to link: the unit is static.
    pub fn is_empty(&self) -> bool {
        self.wanted_by.is_empty() && self.required_by.is_empty() && self.alias.is_empty()
    }
}

/// Parse the `[Install]` keys we act on. Values may be space separated and
/// keys may repeat.
pub fn parse_install_section(unit: &str) -> InstallSection {
    let mut section = InstallSection::default();
    let mut in_install = false;

    for line in unit.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') {
            in_install = line == "[Install]";
            continue;
        }
        if !in_install {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let values = value.split_whitespace().map(str::to_string);
        match key.trim() {
            "WantedBy" => section.wanted_by.extend(values),
            "RequiredBy" => section.required_by.extend(values),
            "Alias" => section.alias.extend(values),
            _ => {}
        }
    }
    section
}

/// `ssh` -> `ssh.service`; names with a unit suffix are kept.
pub fn unit_name(service: &str) -> String {
    const SUFFIXES: &[&str] = &[
        ".service", ".socket", ".timer", ".path", ".target", ".mount",
    ];
    if SUFFIXES.iter().any(|s| service.ends_with(s)) {
        service.to_string()
    } else {
        format!("{}.service", service)
    }
}

/// Template file name of an instance: `serial-getty@ttyS0.service` ->
/// `serial-getty@.service`.
fn template_name(unit: &str) -> Option<String> {
    let (prefix, rest) = unit.split_once('@')?;
    let suffix = rest.rfind('.').map(|i| &rest[i..])?;
    if rest.len() == suffix.len() {
        return None;
    }
    Some(format!("{}@{}", prefix, suffix))
}

/// In-image path (relative to root) of the file backing `unit`.
pub fn find_unit(root: &Path, unit: &str) -> Option<PathBuf> {
    let mut candidates = vec![unit.to_string()];
    if let Some(template) = template_name(unit) {
        candidates.push(template);
    }
    for name in &candidates {
        for dir in UNIT_DIRS {
            let rel = Path::new(dir).join(name);
            if root.join(&rel).is_file() {
                return Some(rel);
            }
        }
    }
    None
}

/// Enable one unit. Returns the links created (relative to root).
pub fn enable_service(root: &Path, service: &str) -> Result<Vec<PathBuf>> {
    let unit = unit_name(service);
    let Some(rel) = find_unit(root, &unit) else {
        bail!(
            "Unit {} not found in {}",
            unit,
            UNIT_DIRS.join(", ")
        );
    };
    let content = fs::read_to_string(root.join(&rel))
        .with_context(|| format!("Failed to read {}", rel.display()))?;
    let install = parse_install_section(&content);
    let target = format!("/{}", rel.display());

    if install.is_empty() {
        bail!(
            "Unit {} has no [Install] section ({}); static units cannot be enabled",
            unit,
            rel.display()
        );
    }
    let wants: Vec<(String, &str)> = install
        .wanted_by
        .iter()
        .map(|t| (t.clone(), "wants"))
        .chain(install.required_by.iter().map(|t| (t.clone(), "requires")))
        .collect();

    let mut links = Vec::new();
    for (by, kind) in wants {
        let link = PathBuf::from("etc/systemd/system")
            .join(format!("{}.{}", by, kind))
            .join(&unit);
        replace_symlink(&target, &root.join(&link))?;
        links.push(link);
    }
    for alias in &install.alias {
        let link = PathBuf::from("etc/systemd/system").join(alias);
        if link == rel {
            continue;
        }
        replace_symlink(&target, &root.join(&link))?;
        links.push(link);
    }
    Ok(links)
}

/// Enable every unit in `services`; the first missing unit fails the call.
pub fn enable_services<'a, I>(root: &Path, services: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut links = Vec::new();
    for service in services {
        links.extend(enable_service(root, service)?);
    }
    Ok(links)
}
