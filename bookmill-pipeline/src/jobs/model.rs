//! Job records

use bookmill_common::events::JobStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Snapshot of one job
///
/// The queue owns the authoritative record; everything handed out is a copy.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    /// Pipeline step name, e.g. `classify`
    #[serde(rename = "type")]
    pub job_type: String,
    /// Owning book
    pub label: String,
    pub params: Value,
    pub status: JobStatus,
    /// Executor-defined progress payload
    pub progress: Option<Value>,
    /// Present only once the job has failed
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn new(job_type: &str, label: &str, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            label: label.to_string(),
            params,
            status: JobStatus::Queued,
            progress: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub(crate) fn apply(&mut self, patch: JobPatch) {
        if let Some(progress) = patch.progress {
            self.progress = Some(progress);
        }
        self.updated_at = Utc::now();
    }

    pub(crate) fn finish(&mut self, status: JobStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Partial update an executor reports through its updater or on completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub progress: Option<Value>,
}

impl JobPatch {
    pub fn progress(progress: Value) -> Self {
        Self {
            progress: Some(progress),
        }
    }
}
