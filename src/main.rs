//! vmbake - Debian VM disk image builder.
//!
//! Builds a bootable Debian disk image from nothing:
//! - sparse raw file, GPT with an EFI system partition and a btrfs root
//! - debootstrap + apt inside the mounted sub-volume
//! - first-boot configuration, then export with `qemu-img`

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use commands::build::BuildOverrides;
use vmbake::config::size::ByteSize;
use vmbake::config::BuildConfig;
use vmbake::export::ImageFormat;
use vmbake::PipelineError;

#[derive(Parser)]
#[command(name = "vmbake")]
#[command(about = "Debian VM disk image builder")]
#[command(
    after_help = "QUICK START:\n  vmbake preflight     Check host tools and privileges\n  vmbake show layout   Print the partition table\n  sudo vmbake build    Build output/debian.raw and output/debian.qcow2"
)]
struct Cli {
    /// Log debug output (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: $VMBAKE_CONFIG, then ~/.config/vmbake/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the raw image and export it
    Build {
        /// Raw image size, e.g. 2G or 4096M
        #[arg(long)]
        size: Option<ByteSize>,

        /// Raw image path
        #[arg(long)]
        raw: Option<PathBuf>,

        /// Exported image path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Export format
        #[arg(long, value_enum)]
        format: Option<ImageFormat>,

        /// Debian release (suite or codename)
        #[arg(long)]
        release: Option<String>,

        /// Debian mirror URL
        #[arg(long)]
        mirror: Option<String>,

        /// Don't run preflight checks first
        #[arg(long)]
        skip_preflight: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (verify host tools before build)
    Preflight {
        /// Fail on warnings as well as failures (exit code 1)
        #[arg(long)]
        strict: bool,
    },

    /// Detach loop devices still backed by a raw image
    Detach {
        /// Raw image left behind by a killed build
        raw: PathBuf,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show effective configuration
    Config,
    /// Show the partition table a build would write
    Layout,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let mut config = BuildConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Build {
            size,
            raw,
            output,
            format,
            release,
            mirror,
            skip_preflight,
        } => {
            BuildOverrides {
                size,
                raw,
                output,
                format,
                release,
                mirror,
            }
            .apply(&mut config);
            commands::cmd_build(&config, skip_preflight)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Layout => commands::show::ShowTarget::Layout,
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }

        Commands::Detach { raw } => {
            commands::cmd_detach(&raw)?;
        }
    }

    Ok(())
}

fn main() -> ExitCode {
    // Load .env if present
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(failed) = e.downcast_ref::<PipelineError>() {
                eprintln!(
                    "error: {} in stage '{}': {}",
                    failed.error.kind(),
                    failed.stage,
                    failed.error
                );
                eprintln!("{}", failed.cleanup);
                eprintln!("The raw image (if created) was kept for inspection.");
            } else {
                eprintln!("error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
