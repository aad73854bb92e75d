//! The build, stage by stage.
//!
//! ```text
//! validate -> bind -> format -> mount -> bootstrap -> install -> inject
//!          -> release -> export
//! ```
//!
//! Fail-fast, no retries. Whatever happens after `validate`, the context is
//! unwound exactly once before [`run`] returns. The raw image is never
//! deleted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cleanup::{CleanupController, CleanupReport};
use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::error::{BuildError, PipelineError, Stage};
use crate::export::{self, ExportReport};
use crate::host::Host;
use crate::timing::Timer;
use crate::{disk, inject, mount, rootfs};

/// A successful build.
#[derive(Debug)]
pub struct BuildReport {
    pub raw_path: PathBuf,
    pub export: ExportReport,
    pub timings: Vec<(Stage, Duration)>,
    pub cleanup: CleanupReport,
}

impl BuildReport {
    pub fn total_time(&self) -> Duration {
        self.timings.iter().map(|(_, d)| *d).sum()
    }
}

/// Build the image described by `config` on `host`.
pub fn run(
    config: &BuildConfig,
    host: Arc<dyn Host>,
    controller: &CleanupController,
) -> Result<BuildReport, PipelineError> {
    let mut timings = Vec::new();

    let mut ctx = run_stage(controller, Stage::Validate, &mut timings, || {
        config.validate()?;
        let work_dir = config.work_dir.clone().unwrap_or_else(std::env::temp_dir);
        BuildContext::new(host, config.image_spec(), &work_dir).map_err(BuildError::Filesystem)
    })
    .map_err(|(stage, error)| PipelineError {
        stage,
        error,
        cleanup: CleanupReport::default(),
    })?;

    if let Err((stage, error)) = populate(&mut ctx, config, controller, &mut timings) {
        let cleanup = controller.unwind(&mut ctx);
        return Err(PipelineError {
            stage,
            error,
            cleanup,
        });
    }

    info!("==> {}", Stage::Release);
    let timer = Timer::start(Stage::Release.name());
    let cleanup = controller.unwind(&mut ctx);
    timings.push((Stage::Release, timer.finish()));
    if !cleanup.is_clean() {
        let error = BuildError::Device(anyhow::anyhow!(
            "image resources were not fully released: {}",
            cleanup.failures.join("; ")
        ));
        return Err(PipelineError {
            stage: Stage::Release,
            error,
            cleanup,
        });
    }

    let raw = ctx.spec.raw_path.clone();
    let exported = run_stage(controller, Stage::Export, &mut timings, || {
        export::export(
            &ctx,
            &raw,
            ctx.spec.export_format,
            &ctx.spec.export_path,
            config.image.compress,
        )
    });
    match exported {
        Ok(export) => Ok(BuildReport {
            raw_path: raw,
            export,
            timings,
            cleanup,
        }),
        Err((stage, error)) => Err(PipelineError {
            stage,
            error,
            cleanup,
        }),
    }
}

/// Everything between validation and release. Stops at the first error.
fn populate(
    ctx: &mut BuildContext,
    config: &BuildConfig,
    controller: &CleanupController,
    timings: &mut Vec<(Stage, Duration)>,
) -> Result<(), (Stage, BuildError)> {
    let host = ctx.host.clone();

    run_stage(controller, Stage::Bind, timings, || {
        disk::bind(ctx, &config.partition_wait)
    })?;
    run_stage(controller, Stage::Format, timings, || {
        disk::filesystem::provision(ctx, &config.layout)
    })?;
    run_stage(controller, Stage::Mount, timings, || {
        mount::plan::mount_all(ctx, config)
    })?;
    run_stage(controller, Stage::Bootstrap, timings, || {
        rootfs::bootstrap(host.as_ref(), &ctx.root_dir, &config.distro)
    })?;
    run_stage(controller, Stage::Install, timings, || {
        rootfs::install_packages(host.as_ref(), &ctx.root_dir, &config.packages)
    })?;
    run_stage(controller, Stage::Inject, timings, || {
        inject::inject(&ctx.root_dir, config)
    })?;
    // A signal that arrived during the last stage.
    controller
        .checkpoint(Stage::Release)
        .map_err(|e| (Stage::Release, e))
}

fn run_stage<T, F>(
    controller: &CleanupController,
    stage: Stage,
    timings: &mut Vec<(Stage, Duration)>,
    f: F,
) -> Result<T, (Stage, BuildError)>
where
    F: FnOnce() -> Result<T, BuildError>,
{
    controller.checkpoint(stage).map_err(|e| (stage, e))?;
    info!("==> {}", stage);
    let timer = Timer::start(stage.name());
    let out = f().map_err(|e| (stage, e))?;
    timings.push((stage, timer.finish()));
    Ok(out)
}
