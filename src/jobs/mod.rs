//! Job bookkeeping.
//!
//! A [`JobStore`] is shared (via [`Arc`](std::sync::Arc)) by everything that
//! needs to look up or update jobs. It's the only shared mutable state in the
//! pipeline.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{evaluation::EvaluationReport, prelude::*};

mod pipeline;

pub use self::pipeline::{Pipeline, PipelineConfig, remove_job_outputs};

/// Job identifier.
pub type JobId = Uuid;

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// The files written for a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputFiles {
    pub txt: PathBuf,
    /// Usually a `.docx` file, but may be plain text if we couldn't write one.
    pub docx: PathBuf,
}

/// What a completed job produced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractionResult {
    pub text: String,
    pub confidence: f64,
    pub processing_time_secs: f64,
    pub ocr_engine: String,
    pub output_files: OutputFiles,
    /// Things that went wrong without stopping the job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Everything we know about one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    #[schemars(with = "String")]
    pub id: JobId,
    pub filename: String,
    pub status: JobStatus,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    pub message: String,
    #[schemars(with = "String")]
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EvaluationReport>,
}

/// In-memory job table, with optional expiry of finished jobs.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    ttl: Option<Duration>,
}

impl JobStore {
    /// A store that keeps jobs until they are removed.
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that forgets finished jobs once they are older than `ttl`.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            jobs: Mutex::default(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        // A panic while holding the lock can't leave a record half-written,
        // so it's safe to keep going.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new job.
    pub fn create(&self, filename: &str) -> JobId {
        self.evict_expired();
        let id = Uuid::new_v4();
        let record = JobRecord {
            id,
            filename: filename.to_owned(),
            status: JobStatus::Processing,
            progress: 0,
            message: "Starting".to_owned(),
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            evaluation: None,
        };
        self.lock().insert(id, record);
        debug!(%id, filename, "Created job");
        id
    }

    /// Record progress on a running job.
    pub fn update_progress(&self, id: JobId, progress: u8, message: &str) {
        self.update(id, |record| {
            record.progress = progress.min(100);
            record.message = message.to_owned();
        });
        debug!(%id, progress, message, "Job progress");
    }

    /// Mark a job as completed.
    pub fn complete(&self, id: JobId, result: ExtractionResult) {
        self.update(id, |record| {
            record.status = JobStatus::Completed;
            record.progress = 100;
            record.message = "Processing completed".to_owned();
            record.finished_at = Some(Utc::now());
            record.result = Some(result);
        });
        info!(%id, "Job completed");
    }

    /// Mark a job as failed.
    pub fn fail(&self, id: JobId, message: &str) {
        self.update(id, |record| {
            record.status = JobStatus::Failed;
            record.message = format!("Error: {message}");
            record.finished_at = Some(Utc::now());
        });
        error!(%id, message, "Job failed");
    }

    /// Attach a grading report to a job.
    pub fn set_evaluation(&self, id: JobId, report: EvaluationReport) {
        self.update(id, |record| record.evaluation = Some(report));
    }

    /// Get a snapshot of a job.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().get(&id).cloned()
    }

    /// Forget a job.
    pub fn remove(&self, id: JobId) -> Option<JobRecord> {
        self.lock().remove(&id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop finished jobs older than our TTL. Returns how many were dropped.
    pub fn evict_expired(&self) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return 0;
        };
        let now = Utc::now();
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, record| match record.finished_at {
            Some(finished_at) if record.status.is_finished() => now - finished_at < ttl,
            _ => true,
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired jobs");
        }
        evicted
    }

    fn update(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) {
        match self.lock().get_mut(&id) {
            Some(record) => f(record),
            None => warn!(%id, "Tried to update unknown job"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> ExtractionResult {
        ExtractionResult {
            text: "hello".to_owned(),
            confidence: 0.9,
            processing_time_secs: 0.1,
            ocr_engine: "fake".to_owned(),
            output_files: OutputFiles {
                txt: PathBuf::from("a.txt"),
                docx: PathBuf::from("a.docx"),
            },
            warnings: vec![],
        }
    }

    #[test]
    fn lifecycle() {
        let store = JobStore::new();
        let id = store.create("page.png");
        let record = store.get(id).unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.progress, 0);

        store.update_progress(id, 50, "Extracting text");
        assert_eq!(store.get(id).unwrap().message, "Extracting text");

        store.complete(id, result());
        let record = store.get(id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.result.unwrap().text, "hello");
    }

    #[test]
    fn failure_keeps_progress() {
        let store = JobStore::new();
        let id = store.create("page.png");
        store.update_progress(id, 30, "Preprocessing image");
        store.fail(id, "could not decode image");
        let record = store.get(id).unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.progress, 30);
        assert_eq!(record.message, "Error: could not decode image");
    }

    #[test]
    fn remove_forgets_job() {
        let store = JobStore::new();
        let id = store.create("page.png");
        assert!(store.remove(id).is_some());
        assert!(store.get(id).is_none());
        assert!(store.remove(id).is_none());
    }

    #[test]
    fn unknown_updates_are_ignored() {
        let store = JobStore::new();
        store.update_progress(Uuid::new_v4(), 10, "Loading image");
        assert!(store.is_empty());
    }

    #[test]
    fn ttl_evicts_only_finished_jobs() {
        let store = JobStore::with_ttl(Some(Duration::ZERO));
        let finished = store.create("a.png");
        store.complete(finished, result());
        let running = store.create("b.png");
        // Creating `running` already evicted `finished`.
        assert!(store.get(finished).is_none());
        assert!(store.get(running).is_some());
        assert_eq!(store.evict_expired(), 0);
    }

    #[test]
    fn no_ttl_keeps_everything() {
        let store = JobStore::new();
        let id = store.create("a.png");
        store.fail(id, "boom");
        store.create("b.png");
        assert_eq!(store.evict_expired(), 0);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn record_serializes_status_in_snake_case() {
        let store = JobStore::new();
        let id = store.create("a.png");
        let json = serde_json::to_value(store.get(id).unwrap()).unwrap();
        assert_eq!(json["status"], "processing");
        assert!(json.get("result").is_none());
    }
}
