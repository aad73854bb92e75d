//! Preflight checks for a vmbake build.
//!
//! Validates host tools, privileges and output paths before anything is
//! created. Run with `vmbake preflight` to check everything is ready.

mod environment;
mod host_tools;
mod types;

use anyhow::{bail, Result};
use tracing::info;

use crate::config::BuildConfig;

pub use host_tools::REQUIRED_TOOLS;
pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &BuildConfig) -> PreflightReport {
    let mut checks = Vec::new();

    info!("Checking host tools...");
    checks.extend(host_tools::check_host_tools());

    info!("Checking build environment...");
    checks.extend(environment::check_build_environment(config));

    PreflightReport { checks }
}

/// Run preflight and bail if any checks fail.
pub fn run_preflight_or_fail(config: &BuildConfig, strict: bool) -> Result<()> {
    let report = run_preflight(config);
    report.print();

    if !report.all_passed(strict) {
        bail!(
            "Preflight failed: {} check(s) failed, {} warning(s). Fix the issues above before building.",
            report.fail_count(),
            report.warn_count()
        );
    }

    println!("All preflight checks passed!\n");
    Ok(())
}
