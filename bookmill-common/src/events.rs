//! Job lifecycle events and the EventBus that carries them
//!
//! Every job emits `Queued`, zero or one `Started`, any number of `Progress`
//! events, and exactly one terminal event (`Completed` or `Failed`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Job status as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` admit no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `Queued` and `Running` jobs are what cancellation acts on
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Job lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Job accepted by the queue
    Queued {
        job_id: Uuid,
        job_type: String,
        label: String,
        timestamp: DateTime<Utc>,
    },

    /// Job admitted to a concurrency slot
    Started {
        job_id: Uuid,
        label: String,
        timestamp: DateTime<Utc>,
    },

    /// Executor-defined progress payload accepted by the queue
    Progress {
        job_id: Uuid,
        label: String,
        progress: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// Terminal: executor resolved
    Completed {
        job_id: Uuid,
        label: String,
        timestamp: DateTime<Utc>,
    },

    /// Terminal: executor rejected, or the job was cancelled
    Failed {
        job_id: Uuid,
        label: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Queued { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Completed { .. } | JobEvent::Failed { .. })
    }

    /// Serialized `type` tag, used as the SSE event name
    pub fn event_type(&self) -> &'static str {
        match self {
            JobEvent::Queued { .. } => "Queued",
            JobEvent::Started { .. } => "Started",
            JobEvent::Progress { .. } => "Progress",
            JobEvent::Completed { .. } => "Completed",
            JobEvent::Failed { .. } => "Failed",
        }
    }
}

/// Broadcast bus for job events
///
/// Subscribers receive events emitted after they subscribe; dropping the
/// receiver unsubscribes. Slow subscribers lose the oldest events once the
/// channel capacity is exceeded.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
