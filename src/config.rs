use crate::stages::StageKind;
use crate::ImageStatus;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_BATCH_LIMIT: i64 = 10;
pub const DEFAULT_MIN_DWELL_SECS: u64 = 180;
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_SCRATCH_DIR: &str = "./tmp/";
pub const DEFAULT_INTERPRETER: &str = "/usr/bin/python3";

/// What to do with an image whose input blob cannot be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingBlobPolicy {
    /// Leave the status alone; the image is retried next cycle.
    Skip,
    /// Mark the image failed.
    Fail,
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub kind: StageKind,
    pub name: String,
    pub status_on_start: ImageStatus,
    pub status_on_done: ImageStatus,
    pub batch_limit: i64,
    pub min_dwell: Option<Duration>,
    pub interval: Duration,
    pub concurrency: usize,
    pub script: PathBuf,
    pub missing_blob: MissingBlobPolicy,
    /// Remove the image's scratch directory once it leaves this stage successfully.
    pub cleanup_on_success: bool,
}

impl StageSettings {
    pub fn new(kind: StageKind, script: impl Into<PathBuf>) -> Self {
        let status_on_start = kind.status_on_start();
        let status_on_done = kind.status_on_done();
        Self {
            kind,
            name: kind.name().to_string(),
            status_on_start,
            status_on_done,
            batch_limit: DEFAULT_BATCH_LIMIT,
            // Uploads have no earlier pipeline transition to dwell after.
            min_dwell: match status_on_start {
                ImageStatus::Uploading => None,
                _ => Some(Duration::from_secs(DEFAULT_MIN_DWELL_SECS)),
            },
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            concurrency: DEFAULT_CONCURRENCY,
            script: script.into(),
            missing_blob: kind.missing_blob_policy(),
            cleanup_on_success: status_on_done == ImageStatus::Done,
        }
    }

    pub fn with_batch_limit(mut self, batch_limit: i64) -> Self {
        self.batch_limit = batch_limit.max(1);
        self
    }

    /// Ignored for the stage that consumes fresh uploads.
    pub fn with_min_dwell(mut self, min_dwell: Duration) -> Self {
        if self.status_on_start != ImageStatus::Uploading {
            self.min_dwell = (!min_dwell.is_zero()).then_some(min_dwell);
        }
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_secs(1));
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub storage_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub interpreter: PathBuf,
    pub process_timeout: Option<Duration>,
    /// Enabled stages only.
    pub stages: Vec<StageSettings>,
}

impl PipelineConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            interpreter: PathBuf::from(DEFAULT_INTERPRETER),
            process_timeout: Some(Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS)),
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageSettings> {
        self.stages.iter().find(|stage| stage.kind == kind)
    }
}
