//! Show command - displays information.

use anyhow::Result;

use vmbake::config::BuildConfig;
use vmbake::disk::layout::render_sfdisk_script;

/// Show target for the show command.
pub enum ShowTarget {
    /// Effective configuration (file + environment + flags)
    Config,
    /// Partition table that `build` would write
    Layout,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &BuildConfig) -> Result<()> {
    match target {
        ShowTarget::Config => config.print()?,
        ShowTarget::Layout => {
            let spec = config.image_spec();
            spec.validate()?;
            println!("# {} ({})", spec.raw_path.display(), spec.size);
            for part in &spec.partitions {
                println!("# {}", part);
            }
            print!("{}", render_sfdisk_script(&spec.partitions));
        }
    }
    Ok(())
}
