//! Error kinds reported by the build pipeline.
//!
//! Stage code builds up context with `anyhow` and maps into a [`BuildError`]
//! kind at the stage boundary, e.g. `.map_err(BuildError::Device)?`.

use std::fmt;

use thiserror::Error;

use crate::cleanup::CleanupReport;

/// What went wrong, by kind.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid or inconsistent image/partition configuration.
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    /// Backing file, loop attach/detach, or partition scan failure.
    #[error("block device error: {0:#}")]
    Device(anyhow::Error),

    /// Formatting or sub-volume activation failure.
    #[error("filesystem error: {0:#}")]
    Filesystem(anyhow::Error),

    /// Bootstrap or package installation failure.
    #[error("bootstrap error: {0:#}")]
    Bootstrap(anyhow::Error),

    /// Missing service unit or unwritable path inside the image.
    #[error("config injection error: {0:#}")]
    ConfigInjection(anyhow::Error),

    /// Conversion failure or violated export precondition.
    #[error("export error: {0:#}")]
    Export(anyhow::Error),

    /// SIGINT or SIGTERM arrived during the build.
    #[error("build interrupted by signal")]
    Interrupted,
}

impl BuildError {
    /// Short name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::Config(_) => "ConfigError",
            BuildError::Device(_) => "DeviceError",
            BuildError::Filesystem(_) => "FilesystemError",
            BuildError::Bootstrap(_) => "BootstrapError",
            BuildError::ConfigInjection(_) => "ConfigInjectionError",
            BuildError::Export(_) => "ExportError",
            BuildError::Interrupted => "Interrupted",
        }
    }

    pub(crate) fn config(msg: impl fmt::Display) -> Self {
        BuildError::Config(anyhow::anyhow!("{}", msg))
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Validate,
    Bind,
    Format,
    Mount,
    Bootstrap,
    Install,
    Inject,
    Release,
    Export,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::Validate,
        Stage::Bind,
        Stage::Format,
        Stage::Mount,
        Stage::Bootstrap,
        Stage::Install,
        Stage::Inject,
        Stage::Release,
        Stage::Export,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Bind => "bind",
            Stage::Format => "format",
            Stage::Mount => "mount",
            Stage::Bootstrap => "bootstrap",
            Stage::Install => "install",
            Stage::Inject => "inject",
            Stage::Release => "release",
            Stage::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed build: the stage it died in, why, and what the unwind did.
#[derive(Debug, Error)]
#[error("build failed at stage '{stage}' ({kind}): {error}", kind = .error.kind())]
pub struct PipelineError {
    pub stage: Stage,
    pub error: BuildError,
    pub cleanup: CleanupReport,
}
