//! The image's block-device side: backing file, partition table, loop
//! device and filesystems.

pub mod binder;
pub mod filesystem;
pub mod layout;

use std::path::PathBuf;

pub use binder::{attached_loop_devices, bind, detach_all, unbind};
pub use layout::{ImageSpec, PartitionAttribute, PartitionSize, PartitionSpec};

/// A loop device backed by the raw image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// `/dev/loopN`
    pub loop_path: PathBuf,
    pub backing: PathBuf,
    /// Partition nodes (`/dev/loopNpK`) in table order. Empty until the
    /// partition scan has been observed.
    pub partitions: Vec<PathBuf>,
    pub attached: bool,
}

impl BlockDevice {
    /// A handle for a device `losetup` just attached.
    pub fn attached(loop_path: PathBuf, backing: PathBuf) -> Self {
        Self {
            loop_path,
            backing,
            partitions: Vec::new(),
            attached: true,
        }
    }
}
