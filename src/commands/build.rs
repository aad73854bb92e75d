//! Build command - builds and exports a Debian disk image.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use vmbake::cleanup::CleanupController;
use vmbake::config::size::ByteSize;
use vmbake::config::BuildConfig;
use vmbake::export::ImageFormat;
use vmbake::host::SystemHost;
use vmbake::timing::format_duration;
use vmbake::{pipeline, preflight, BuildReport};

/// Command-line overrides, applied on top of file and environment config.
#[derive(Debug, Default)]
pub struct BuildOverrides {
    pub size: Option<ByteSize>,
    pub raw: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub format: Option<ImageFormat>,
    pub release: Option<String>,
    pub mirror: Option<String>,
}

impl BuildOverrides {
    pub fn apply(self, config: &mut BuildConfig) {
        if let Some(size) = self.size {
            config.image.size = size;
        }
        if let Some(raw) = self.raw {
            config.image.raw_path = raw;
        }
        if let Some(format) = self.format {
            config.image.export_format = format;
            // Keep the default output name in step with the chosen format.
            if self.output.is_none() {
                config.image.export_path.set_extension(format.extension());
            }
        }
        if let Some(output) = self.output {
            config.image.export_path = output;
        }
        if let Some(release) = self.release {
            config.distro.release = release;
        }
        if let Some(mirror) = self.mirror {
            config.distro.mirror = mirror;
        }
    }
}

/// Execute the build command.
pub fn cmd_build(config: &BuildConfig, skip_preflight: bool) -> Result<()> {
    println!("=== vmbake: Debian {} image ===\n", config.distro.release);
    let build_start = Instant::now();

    if skip_preflight {
        println!("Skipping preflight checks (--skip-preflight)\n");
    } else {
        preflight::run_preflight_or_fail(config, false)?;
    }

    let controller = CleanupController::install()?;
    let report = pipeline::run(config, Arc::new(SystemHost), &controller)?;

    print_summary(&report);
    println!(
        "\n=== Build complete in {} ===",
        format_duration(build_start.elapsed())
    );
    Ok(())
}

fn print_summary(report: &BuildReport) {
    println!("\nStage timings:");
    for (stage, took) in &report.timings {
        println!("  {:<10} {}", stage.name(), format_duration(*took));
    }
    println!("\nArtifacts:");
    println!("  raw:      {}", report.raw_path.display());
    println!(
        "  {:<9} {}",
        format!("{}:", report.export.format),
        report.export.path.display()
    );
    println!("  sha256:   {}", report.export.sha256);
    println!("  checksum: {}", report.export.checksum_path.display());
}
