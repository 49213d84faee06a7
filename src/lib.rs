use std::path::Path;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod bridge;
pub mod chunked;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod realtime;
pub mod remote;
pub mod retry;
pub mod telemetry;
pub mod validation;
pub mod worker;

pub use coordinator::{CoordinatorConfig, CoordinatorError, JobCoordinator, JobEvent, Services};
pub use error::{classify, AppError, ErrorContext, ErrorKind, FailureReason, RawError};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Merge,
    Compress,
    Split,
    Validate,
    Rotate,
    Watermark,
    Convert,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Merge => "merge",
            JobKind::Compress => "compress",
            JobKind::Split => "split",
            JobKind::Validate => "validate",
            JobKind::Rotate => "rotate",
            JobKind::Watermark => "watermark",
            JobKind::Convert => "convert",
        }
    }

    /// Kinds the background workers know how to run.
    pub fn runs_locally(&self) -> bool {
        matches!(self, JobKind::Merge | JobKind::Compress | JobKind::Validate)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub filename: String,
    pub size_bytes: u64,
}

/// A file handed to the coordinator. The bytes are reference counted, so
/// cloning an `InputFile` never copies the document.
#[derive(Debug, Clone)]
pub struct InputFile {
    pub name: String,
    pub data: Bytes,
}

impl InputFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub fn descriptor(&self) -> InputDescriptor {
        InputDescriptor {
            filename: self.name.clone(),
            size_bytes: self.size(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Maximum,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Maximum => "maximum",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingOptions {
    #[serde(default)]
    pub quality: Quality,
    pub output_format: Option<String>,
    pub page_range: Option<String>,
    pub compression_level: Option<u8>,
    #[serde(default)]
    pub require_enterprise_compliance: bool,
    #[serde(default = "default_true")]
    pub preserve_metadata: bool,
    #[serde(default)]
    pub optimize_for_web: bool,
    pub watermark_text: Option<String>,
    pub rotation_degrees: Option<i32>,
    /// Extra documents appended after the primary file for `merge`.
    #[serde(skip)]
    pub merge_with: Vec<InputFile>,
}

fn default_true() -> bool {
    true
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            output_format: None,
            page_range: None,
            compression_level: None,
            require_enterprise_compliance: false,
            preserve_metadata: true,
            optimize_for_web: false,
            watermark_text: None,
            rotation_degrees: None,
            merge_with: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validation,
    Loading,
    Processing,
    Saving,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Stage,
    pub percentage: u8,
    pub current_item: Option<String>,
    pub items_processed: Option<u32>,
    pub items_total: Option<u32>,
    pub bytes_processed: Option<u64>,
    pub bytes_total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<JobId>, stage: Stage, percentage: u8) -> Self {
        Self {
            job_id: job_id.into(),
            stage,
            percentage: percentage.min(100),
            current_item: None,
            items_processed: None,
            items_total: None,
            bytes_processed: None,
            bytes_total: None,
        }
    }

    pub fn with_items(mut self, processed: u32, total: u32) -> Self {
        self.items_processed = Some(processed);
        self.items_total = Some(total);
        self
    }

    pub fn with_bytes(mut self, processed: u64, total: u64) -> Self {
        self.bytes_processed = Some(processed);
        self.bytes_total = Some(total);
        self
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    Local,
    Remote,
}

#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub data: Option<Bytes>,
    pub pages_processed: u32,
    pub warnings: Vec<String>,
    pub engine_used: Option<String>,
    pub detail: Option<remote::ResultResponse>,
    pub download_url: Option<String>,
}

/// Outcome of feeding one progress sample to a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Advanced,
    /// Same percentage as already recorded.
    Unchanged,
    /// Lower than the recorded percentage, or the job is not processing.
    Stale,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: Status,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: InputDescriptor,
    pub target: Option<ExecutionTarget>,
    pub attempt: u32,
    pub result: Option<JobOutput>,
    pub error: Option<AppError>,
}

impl Job {
    pub fn new(kind: JobKind, input: InputDescriptor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: Status::Queued,
            progress: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input,
            target: None,
            attempt: 1,
            result: None,
            error: None,
        }
    }

    pub fn start(&mut self, target: ExecutionTarget) -> bool {
        if self.status != Status::Queued {
            return false;
        }
        self.status = Status::Processing;
        self.target = Some(target);
        self.started_at = Some(Utc::now());
        true
    }

    /// Progress never moves backwards and only `complete` may record 100
    /// on the normal path; a sample of 100 is treated as completion.
    pub fn record_progress(&mut self, percentage: u8) -> ProgressUpdate {
        if self.status != Status::Processing || percentage < self.progress {
            return ProgressUpdate::Stale;
        }
        if percentage == self.progress {
            return ProgressUpdate::Unchanged;
        }
        if percentage >= 100 {
            self.finish(Status::Completed);
            return ProgressUpdate::Advanced;
        }
        self.progress = percentage;
        ProgressUpdate::Advanced
    }

    pub fn complete(&mut self, output: JobOutput) -> bool {
        if self.status != Status::Processing {
            return false;
        }
        self.result = Some(output);
        self.finish(Status::Completed);
        true
    }

    pub fn fail(&mut self, error: AppError) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.error = Some(error);
        self.status = Status::Failed;
        self.completed_at = Some(Utc::now());
        true
    }

    pub fn is_retryable(&self) -> bool {
        self.status == Status::Failed && self.error.as_ref().is_some_and(|err| err.retryable)
    }

    /// Puts a retryable failed job back into the queue as a fresh run.
    pub fn requeue(&mut self) -> bool {
        if !self.is_retryable() {
            return false;
        }
        self.status = Status::Queued;
        self.progress = 0;
        self.started_at = None;
        self.completed_at = None;
        self.target = None;
        self.result = None;
        self.error = None;
        self.attempt += 1;
        true
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }

    fn finish(&mut self, status: Status) {
        self.status = status;
        self.progress = 100;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobKind::Compress,
            InputDescriptor {
                filename: "report.pdf".into(),
                size_bytes: 1024,
            },
        )
    }

    #[test]
    fn late_progress_is_dropped() {
        let mut job = job();
        assert!(job.start(ExecutionTarget::Local));

        let mut recorded = Vec::new();
        for pct in [10, 30, 20, 30, 100] {
            if job.record_progress(pct) != ProgressUpdate::Stale {
                recorded.push(job.progress);
            }
        }

        assert_eq!(recorded, vec![10, 30, 30, 100]);
        assert_eq!(job.status, Status::Completed);
    }

    #[test]
    fn progress_is_ignored_before_start() {
        let mut job = job();
        assert_eq!(job.record_progress(40), ProgressUpdate::Stale);
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn completed_job_cannot_fail() {
        let mut job = job();
        job.start(ExecutionTarget::Local);
        assert!(job.complete(JobOutput::default()));
        assert_eq!(job.progress, 100);

        let err = classify(&RawError::named(error::names::PROCESSING, "late"), None);
        assert!(!job.fail(err));
        assert_eq!(job.status, Status::Completed);
        assert!(!job.start(ExecutionTarget::Local));
    }

    #[test]
    fn requeue_only_from_retryable_failure() {
        let mut job = job();
        job.start(ExecutionTarget::Remote);
        assert!(!job.requeue());

        job.fail(classify(&RawError::new("boom").with_status(503), None));
        assert!(job.requeue());
        assert_eq!(job.status, Status::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.input.filename, "report.pdf");

        job.start(ExecutionTarget::Remote);
        job.fail(classify(&RawError::new("denied").with_status(403), None));
        assert!(!job.requeue());
        assert_eq!(job.status, Status::Failed);
    }

    #[test]
    fn queued_job_can_be_failed_directly() {
        let mut job = job();
        let err = classify(&RawError::cancelled("stop"), None);
        assert!(job.fail(err));
        assert_eq!(job.status, Status::Failed);
        assert_ne!(job.progress, 100);
    }
}
