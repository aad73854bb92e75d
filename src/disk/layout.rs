//! Image and GPT partition layout.
//!
//! The partition table is written by feeding `sfdisk` a script rendered from
//! the ordered [`PartitionSpec`] list. Rendering is a pure function: the same
//! list always yields the same script, so two builds of one layout get the
//! same type GUIDs, names, sizes and attribute bits. Only the per-partition
//! instance UUIDs (chosen by sfdisk) differ.

use std::collections::HashSet;
use std::fmt::{self, Write as _};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::size::{ByteSize, MIB};
use crate::error::BuildError;
use crate::export::ImageFormat;

/// Sector size in bytes
pub const SECTOR_SIZE: u64 = 512;

/// First partition starts at this offset (1MB for GPT + alignment)
pub const FIRST_LBA: u64 = 2048; // 1MB / 512

/// Space the partitions cannot use: the 1 MiB leading alignment (primary
/// header and entries) plus 1 MiB reserved for the backup header at the end.
pub const GPT_OVERHEAD: u64 = 2 * MIB;

/// EFI System Partition
pub const ESP_TYPE_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

/// Linux root (x86-64), as in the Discoverable Partitions Specification.
pub const ROOT_X86_64_TYPE_GUID: &str = "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709";

/// GPT partition attribute bits understood by sfdisk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionAttribute {
    /// Bit 0: platform required.
    RequiredPartition,
    /// Bit 1: firmware must not expose the partition as a block device.
    NoBlockIoProtocol,
    /// Bit 2: legacy BIOS bootable.
    LegacyBiosBootable,
    /// Bit 59: grow the filesystem to fill the partition on first boot.
    GrowFileSystem,
    /// Bit 60: mount read-only.
    ReadOnly,
    /// Bit 63: do not auto-mount.
    NoAuto,
}

impl PartitionAttribute {
    pub fn bit(self) -> u8 {
        match self {
            PartitionAttribute::RequiredPartition => 0,
            PartitionAttribute::NoBlockIoProtocol => 1,
            PartitionAttribute::LegacyBiosBootable => 2,
            PartitionAttribute::GrowFileSystem => 59,
            PartitionAttribute::ReadOnly => 60,
            PartitionAttribute::NoAuto => 63,
        }
    }

    /// Token used in an sfdisk `attrs=` field.
    fn sfdisk_token(self) -> String {
        match self {
            PartitionAttribute::RequiredPartition => "RequiredPartition".to_string(),
            PartitionAttribute::NoBlockIoProtocol => "NoBlockIOProtocol".to_string(),
            PartitionAttribute::LegacyBiosBootable => "LegacyBIOSBootable".to_string(),
            other => format!("GUID:{}", other.bit()),
        }
    }
}

/// Requested size of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionSize {
    Fixed(ByteSize),
    /// Take whatever is left; only valid on the last partition.
    Grow,
}

/// One GPT entry, in table order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub type_guid: String,
    pub label: String,
    pub size: PartitionSize,
    #[serde(default)]
    pub attributes: Vec<PartitionAttribute>,
}

impl PartitionSpec {
    pub fn fixed(type_guid: &str, label: &str, size: ByteSize) -> Self {
        Self {
            type_guid: type_guid.to_string(),
            label: label.to_string(),
            size: PartitionSize::Fixed(size),
            attributes: Vec::new(),
        }
    }

    pub fn grow(type_guid: &str, label: &str) -> Self {
        Self {
            type_guid: type_guid.to_string(),
            label: label.to_string(),
            size: PartitionSize::Grow,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attr: PartitionAttribute) -> Self {
        if !self.attributes.contains(&attr) {
            self.attributes.push(attr);
        }
        self
    }

    pub fn auto_grows(&self) -> bool {
        self.attributes.contains(&PartitionAttribute::GrowFileSystem)
    }
}

/// The image to build: backing file, size, layout and export target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    pub size: ByteSize,
    pub raw_path: PathBuf,
    pub export_format: ImageFormat,
    pub export_path: PathBuf,
    pub partitions: Vec<PartitionSpec>,
}

impl ImageSpec {
    /// Check the layout fits the image and the partition invariants hold.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.size.as_bytes() == 0 {
            return Err(BuildError::config("image size must be positive"));
        }
        if self.partitions.is_empty() {
            return Err(BuildError::config("partition table has no entries"));
        }

        let last = self.partitions.len() - 1;
        let mut labels = HashSet::new();
        let mut fixed_total: u64 = 0;
        let mut growers = 0;

        for (idx, part) in self.partitions.iter().enumerate() {
            if part.label.trim().is_empty() {
                return Err(BuildError::config(format!(
                    "partition {} has an empty label",
                    idx + 1
                )));
            }
            if !is_plain_label(&part.label) {
                return Err(BuildError::config(format!(
                    "partition label '{}' may only contain ASCII letters, digits, '-', '_' and '.'",
                    part.label
                )));
            }
            if !labels.insert(part.label.as_str()) {
                return Err(BuildError::config(format!(
                    "duplicate partition label '{}'",
                    part.label
                )));
            }
            if !is_guid(&part.type_guid) {
                return Err(BuildError::config(format!(
                    "partition '{}' has malformed type GUID '{}'",
                    part.label, part.type_guid
                )));
            }

            match part.size {
                PartitionSize::Fixed(size) => {
                    if size.as_bytes() == 0 || !size.is_mib_aligned() {
                        return Err(BuildError::config(format!(
                            "partition '{}' size {} must be a positive whole number of MiB",
                            part.label,
                            size.as_bytes()
                        )));
                    }
                    fixed_total = fixed_total.checked_add(size.as_bytes()).ok_or_else(|| {
                        BuildError::config("sum of partition sizes overflows")
                    })?;
                }
                PartitionSize::Grow if idx != last => {
                    return Err(BuildError::config(format!(
                        "partition '{}' grows to fill the disk but is not the last entry",
                        part.label
                    )));
                }
                PartitionSize::Grow => {}
            }

            if part.auto_grows() {
                growers += 1;
                if idx != last {
                    return Err(BuildError::config(format!(
                        "partition '{}' carries the auto-grow flag but is not the last entry",
                        part.label
                    )));
                }
            }
        }

        if growers > 1 {
            return Err(BuildError::config(
                "more than one partition carries the auto-grow flag",
            ));
        }

        let required = fixed_total
            .checked_add(GPT_OVERHEAD)
            .ok_or_else(|| BuildError::config("sum of partition sizes overflows"))?;
        if self.size.as_bytes() <= required {
            return Err(BuildError::config(format!(
                "image size {} does not exceed partitions ({}) plus GPT overhead ({})",
                self.size,
                ByteSize::bytes(fixed_total),
                ByteSize::bytes(GPT_OVERHEAD)
            )));
        }
        Ok(())
    }
}

/// Labels end up quoted in the sfdisk script and unquoted in `LABEL=`
/// references (fstab, kernel command line).
fn is_plain_label(label: &str) -> bool {
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_guid(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    groups.len() == lens.len()
        && groups
            .iter()
            .zip(lens)
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Render the sfdisk script for a partition list.
pub fn render_sfdisk_script(partitions: &[PartitionSpec]) -> String {
    let mut script = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(script, "label: gpt");
    let _ = writeln!(script, "unit: sectors");
    let _ = writeln!(script, "sector-size: {}", SECTOR_SIZE);
    let _ = writeln!(script, "first-lba: {}", FIRST_LBA);
    let _ = writeln!(script);

    for part in partitions {
        let mut fields = Vec::new();
        if let PartitionSize::Fixed(size) = part.size {
            fields.push(format!("size={}", size.as_bytes() / SECTOR_SIZE));
        }
        fields.push(format!("type={}", part.type_guid.to_uppercase()));
        fields.push(format!("name=\"{}\"", part.label));
        if !part.attributes.is_empty() {
            let attrs: Vec<String> = part.attributes.iter().map(|a| a.sfdisk_token()).collect();
            fields.push(format!("attrs=\"{}\"", attrs.join(" ")));
        }
        let _ = writeln!(script, "{}", fields.join(", "));
    }
    script
}

/// Kernel name of the `index`th (0-based) partition node of a loop device.
pub fn partition_node(loop_device: &std::path::Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}p{}", loop_device.display(), index + 1))
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.size {
            PartitionSize::Fixed(size) => size.to_string(),
            PartitionSize::Grow => "rest".to_string(),
        };
        write!(f, "{} ({}, {})", self.label, size, self.type_guid)?;
        if self.auto_grows() {
            write!(f, " [auto-grow]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn debian_layout() -> Vec<PartitionSpec> {
        vec![
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(200)),
            PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, "Debian")
                .with_attribute(PartitionAttribute::GrowFileSystem),
        ]
    }

    fn spec(size: ByteSize, partitions: Vec<PartitionSpec>) -> ImageSpec {
        ImageSpec {
            size,
            raw_path: PathBuf::from("/tmp/disk.raw"),
            export_format: ImageFormat::Qcow2,
            export_path: PathBuf::from("/tmp/disk.qcow2"),
            partitions,
        }
    }

    #[test]
    fn test_debian_layout_is_valid() {
        spec(ByteSize::gib(2), debian_layout()).validate().unwrap();
    }

    #[test]
    fn test_size_must_exceed_partitions_plus_overhead() {
        let parts = vec![
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(200)),
            PartitionSpec::fixed(ROOT_X86_64_TYPE_GUID, "Debian", ByteSize::mib(100)),
        ];
        // Exactly partitions + overhead is not enough.
        let err = spec(ByteSize::mib(302), parts.clone()).validate().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        spec(ByteSize::mib(303), parts).validate().unwrap();
    }

    #[test]
    fn test_zero_size_rejected() {
        let err = spec(ByteSize::bytes(0), debian_layout()).validate().unwrap_err();
        assert!(err.to_string().contains("positive"));
    }

    #[test]
    fn test_auto_grow_must_be_last() {
        let parts = vec![
            PartitionSpec::fixed(ROOT_X86_64_TYPE_GUID, "Debian", ByteSize::mib(500))
                .with_attribute(PartitionAttribute::GrowFileSystem),
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(200)),
        ];
        let err = spec(ByteSize::gib(2), parts).validate().unwrap_err();
        assert!(err.to_string().contains("auto-grow"), "{}", err);
    }

    #[test]
    fn test_duplicate_auto_grow_rejected() {
        // Two growers: the first one trips the "not last" check.
        let parts = vec![
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(200))
                .with_attribute(PartitionAttribute::GrowFileSystem),
            PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, "Debian")
                .with_attribute(PartitionAttribute::GrowFileSystem),
        ];
        let err = spec(ByteSize::gib(2), parts).validate().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn test_grow_size_must_be_last() {
        let parts = vec![
            PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, "Debian"),
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(200)),
        ];
        assert!(spec(ByteSize::gib(2), parts).validate().is_err());
    }

    #[test]
    fn test_unaligned_and_duplicate_labels_rejected() {
        let unaligned = vec![PartitionSpec::fixed(
            ESP_TYPE_GUID,
            "ESP",
            ByteSize::bytes(MIB + 512),
        )];
        assert!(spec(ByteSize::gib(1), unaligned).validate().is_err());

        let dupes = vec![
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(10)),
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(10)),
        ];
        let err = spec(ByteSize::gib(1), dupes).validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_partition_sum_overflow_is_config_error() {
        let huge = ByteSize::bytes(u64::MAX - (u64::MAX % MIB));
        let parts = vec![
            PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", huge),
            PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, "Debian"),
        ];
        let err = spec(ByteSize::gib(2), parts).validate().unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("overflows"), "{}", err);
    }

    #[test]
    fn test_labels_that_break_scripts_rejected() {
        for label in ["My \"Root\"", "a,b", "has space", "Débian"] {
            let parts = vec![
                PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(10)),
                PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, label),
            ];
            let err = spec(ByteSize::gib(1), parts).validate().unwrap_err();
            assert_eq!(err.kind(), "ConfigError", "{}", label);
        }
        let parts = vec![PartitionSpec::grow(ROOT_X86_64_TYPE_GUID, "debian-root_1.0")];
        spec(ByteSize::gib(1), parts).validate().unwrap();
    }

    #[test]
    fn test_malformed_guid_rejected() {
        let parts = vec![PartitionSpec::fixed("not-a-guid", "ESP", ByteSize::mib(10))];
        assert!(spec(ByteSize::gib(1), parts).validate().is_err());
    }

    #[test]
    fn test_sfdisk_script_content() {
        let script = render_sfdisk_script(&debian_layout());
        let expected = "label: gpt\n\
                        unit: sectors\n\
                        sector-size: 512\n\
                        first-lba: 2048\n\
                        \n\
                        size=409600, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B, name=\"ESP\"\n\
                        type=4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709, name=\"Debian\", attrs=\"GUID:59\"\n";
        assert_eq!(script, expected);
    }

    #[test]
    fn test_sfdisk_script_is_deterministic() {
        let a = render_sfdisk_script(&debian_layout());
        let b = render_sfdisk_script(&debian_layout());
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_named_attributes() {
        let part = PartitionSpec::fixed(ESP_TYPE_GUID, "ESP", ByteSize::mib(10))
            .with_attribute(PartitionAttribute::RequiredPartition)
            .with_attribute(PartitionAttribute::NoAuto);
        let script = render_sfdisk_script(&[part]);
        assert!(script.contains("attrs=\"RequiredPartition GUID:63\""), "{}", script);
    }

    #[test]
    fn test_partition_node_names() {
        let loop_dev = Path::new("/dev/loop7");
        assert_eq!(partition_node(loop_dev, 0), PathBuf::from("/dev/loop7p1"));
        assert_eq!(partition_node(loop_dev, 1), PathBuf::from("/dev/loop7p2"));
    }
}
