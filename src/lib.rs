//! vmbake library exports.
//!
//! The binary is a thin CLI over [`pipeline::run`]. Everything is exposed
//! here so the integration tests in `tests/` can drive a whole build against
//! a `host::RecordingHost` (`test-utils` feature, on by default).

pub mod cleanup;
pub mod common;
pub mod config;
pub mod context;
pub mod disk;
pub mod error;
pub mod export;
pub mod host;
pub mod inject;
pub mod mount;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod rootfs;
pub mod timing;

pub use config::BuildConfig;
pub use error::{BuildError, PipelineError, Stage};
pub use pipeline::BuildReport;
