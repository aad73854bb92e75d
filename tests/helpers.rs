//! Shared test utilities for vmbake tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use vmbake::cleanup::CleanupController;
use vmbake::config::BuildConfig;
use vmbake::host::RecordingHost;
use vmbake::{pipeline, BuildReport, PipelineError};

/// Default-config build pointed into a temporary directory, run against a
/// [`RecordingHost`] whose debootstrap lays down a minimal tree.
pub struct TestEnv {
    /// Temporary directory (kept alive for lifetime of TestEnv)
    pub _temp_dir: TempDir,
    pub base: PathBuf,
    pub config: BuildConfig,
    pub host: Arc<RecordingHost>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path().to_path_buf();

        let mut config = BuildConfig::default();
        config.image.raw_path = base.join("output/debian.raw");
        config.image.export_path = base.join("output/debian.qcow2");
        config.work_dir = Some(base.join("work"));
        config.partition_wait.retries = 3;
        config.partition_wait.backoff_ms = 1;

        let host = Arc::new(RecordingHost::new());
        let units: Vec<&str> = config.services.iter().map(String::as_str).collect();
        host.simulate_debootstrap(&units);

        Self {
            _temp_dir: temp_dir,
            base,
            config,
            host,
        }
    }

    /// Run the whole pipeline with a controller that never sees a signal.
    pub fn run(&self) -> Result<BuildReport, PipelineError> {
        self.run_with(&CleanupController::detached())
    }

    pub fn run_with(&self, controller: &CleanupController) -> Result<BuildReport, PipelineError> {
        pipeline::run(&self.config, self.host.clone(), controller)
    }

    pub fn raw_path(&self) -> &Path {
        &self.config.image.raw_path
    }

    pub fn work_dir(&self) -> PathBuf {
        self.base.join("work")
    }

    /// Entries left in the work directory (scratch dirs that were not
    /// removed).
    pub fn leftover_scratch(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.work_dir()) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Contents of the root sub-volume as written through the mount.
    pub fn root_contents(&self) -> PathBuf {
        self.host
            .filesystem_contents(
                Path::new("/dev/loop7p2"),
                Some(self.config.root_mount_data().as_str()),
            )
            .expect("root sub-volume was never mounted")
    }

    /// Nothing mounted, no loop device, no scratch directory.
    pub fn assert_released(&self) {
        assert!(
            self.host.mounted().is_empty(),
            "still mounted: {:?}",
            self.host.mounted()
        );
        assert!(
            self.host.attached_loops().is_empty(),
            "still attached: {:?}",
            self.host.attached_loops()
        );
        assert!(
            self.leftover_scratch().is_empty(),
            "scratch dirs left: {:?}",
            self.leftover_scratch()
        );
    }
}
