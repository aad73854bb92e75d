//! Detach command - releases loop devices left behind by a killed build.

use anyhow::{bail, Result};
use std::path::Path;

use vmbake::disk::detach_all;
use vmbake::host::SystemHost;

/// Execute the detach command.
pub fn cmd_detach(raw: &Path) -> Result<()> {
    if !raw.is_file() {
        bail!("{} is not an image file", raw.display());
    }
    let detached = detach_all(&SystemHost, raw)?;
    if detached.is_empty() {
        println!("No loop devices attached to {}", raw.display());
    }
    for dev in &detached {
        println!("Detached {}", dev.display());
    }
    Ok(())
}
