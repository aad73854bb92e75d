//! Preflight command - runs preflight checks.

use anyhow::Result;

use vmbake::config::BuildConfig;
use vmbake::preflight;

/// Execute the preflight command.
pub fn cmd_preflight(config: &BuildConfig, strict: bool) -> Result<()> {
    if strict {
        preflight::run_preflight_or_fail(config, true)?;
    } else {
        let report = preflight::run_preflight(config);
        report.print();
        if !report.all_passed(false) {
            println!("Some checks failed. `vmbake build` will refuse to start.");
        }
    }
    Ok(())
}
