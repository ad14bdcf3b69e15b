//! Bounded-concurrency job queue
//!
//! All bookkeeping (enqueue, lookups, admission, cancellation) happens under
//! one synchronous lock and never awaits, so a status read always reflects
//! the last completed bookkeeping step. Job events are sent before that lock
//! is released, so each job's events arrive in transition order and end with
//! exactly one terminal event. Executors run as spawned tasks; when
//! one settles, its slot is released and the queue drains again.
//!
//! Cancellation is cooperative. It flips the job to `failed`, cancels the
//! job's token and frees its slot, but cannot interrupt an executor waiting
//! on I/O. The executor's later `update` calls are rejected and its settle is
//! ignored, so a cancelled job can never be resurrected. An executor that
//! hangs without being cancelled holds its slot indefinitely.

use super::model::{Job, JobPatch};
use super::registry::{Executor, ExecutorRegistry};
use bookmill_common::events::{EventBus, JobEvent, JobStatus};
use bookmill_common::{Error, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ceiling on simultaneously running jobs
pub const MAX_CONCURRENT_JOBS: usize = 16;

/// Error recorded on jobs failed by label cancellation
pub const CANCELLED_MESSAGE: &str = "Book deleted";

struct JobEntry {
    job: Job,
    token: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<Uuid, JobEntry>,
    /// Every job id in enqueue order
    order: Vec<Uuid>,
    /// Queued job ids awaiting admission, FIFO
    pending: VecDeque<Uuid>,
    /// Jobs currently in `running`
    running: usize,
}

struct Inner {
    state: Mutex<QueueState>,
    executors: ExecutorRegistry,
    events: EventBus,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Job queue handle; clones share the same queue
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(executors: ExecutorRegistry, events: EventBus) -> Self {
        info!(job_types = ?executors.job_types(), "Job queue created");
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                executors,
                events,
            }),
        }
    }

    /// Create a `queued` job and try to start it; never waits for execution
    ///
    /// Must be called from within a Tokio runtime, since admission spawns the
    /// executor task.
    pub fn enqueue(&self, job_type: &str, label: &str, params: Value) -> Uuid {
        let job = Job::new(job_type, label, params);
        let job_id = job.id;
        let created_at = job.created_at;

        {
            let mut state = self.inner.state();
            state.order.push(job_id);
            state.pending.push_back(job_id);
            state.jobs.insert(
                job_id,
                JobEntry {
                    job,
                    token: CancellationToken::new(),
                },
            );
            self.inner.events.emit_lossy(JobEvent::Queued {
                job_id,
                job_type: job_type.to_string(),
                label: label.to_string(),
                timestamp: created_at,
            });
        }

        info!(job_id = %job_id, job_type, label, "Job queued");

        drain(&self.inner);
        job_id
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.state().jobs.get(&job_id).map(|e| e.job.clone())
    }

    /// Jobs for `label` in enqueue order
    pub fn list_jobs(&self, label: &str) -> Vec<Job> {
        let state = self.inner.state();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|e| e.job.label == label)
            .map(|e| e.job.clone())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state().running
    }

    /// Jobs still queued or running
    pub fn active_count(&self) -> usize {
        self.inner
            .state()
            .jobs
            .values()
            .filter(|e| e.job.status.is_active())
            .count()
    }

    pub fn has_executor(&self, job_type: &str) -> bool {
        self.inner.executors.contains(job_type)
    }

    /// Fail every queued or running job of `label`
    ///
    /// Returns the number of jobs affected; a second call returns 0.
    pub fn cancel_by_label(&self, label: &str) -> usize {
        let mut cancelled = Vec::new();
        let mut freed_slots = 0;

        {
            let mut state = self.inner.state();
            let QueueState {
                jobs,
                order,
                pending,
                running,
            } = &mut *state;

            for id in order.iter() {
                let Some(entry) = jobs.get_mut(id) else {
                    continue;
                };
                if entry.job.label != label || !entry.job.status.is_active() {
                    continue;
                }
                if entry.job.status == JobStatus::Running {
                    *running -= 1;
                    freed_slots += 1;
                }
                entry
                    .job
                    .finish(JobStatus::Failed, Some(CANCELLED_MESSAGE.to_string()));
                entry.token.cancel();
                self.inner.events.emit_lossy(JobEvent::Failed {
                    job_id: *id,
                    label: label.to_string(),
                    error: CANCELLED_MESSAGE.to_string(),
                    timestamp: Utc::now(),
                });
                cancelled.push(*id);
            }

            pending.retain(|id| {
                jobs.get(id)
                    .is_some_and(|e| e.job.status == JobStatus::Queued)
            });
        }

        if !cancelled.is_empty() {
            info!(label, cancelled = cancelled.len(), freed_slots, "Jobs cancelled");
        }
        if freed_slots > 0 {
            drain(&self.inner);
        }
        cancelled.len()
    }

    /// Receive job events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("JobQueue")
            .field("jobs", &state.jobs.len())
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}

/// Admit queued jobs in FIFO order until the ceiling is reached
fn drain(inner: &Arc<Inner>) {
    loop {
        let start = {
            let mut state = inner.state();
            if state.running >= MAX_CONCURRENT_JOBS {
                break;
            }
            let Some(job_id) = state.pending.pop_front() else {
                break;
            };
            match admit(inner, &mut state, job_id) {
                Some(Admission::Start(job, token, executor)) => {
                    inner.events.emit_lossy(JobEvent::Started {
                        job_id: job.id,
                        label: job.label.clone(),
                        timestamp: Utc::now(),
                    });
                    Some((job, token, executor))
                }
                Some(Admission::Rejected(event)) => {
                    inner.events.emit_lossy(event);
                    None
                }
                None => None,
            }
        };

        if let Some((job, token, executor)) = start {
            tokio::spawn(run(inner.clone(), job, token, executor));
        }
    }
}

enum Admission {
    Start(Job, CancellationToken, Executor),
    Rejected(JobEvent),
}

fn admit(inner: &Inner, state: &mut QueueState, job_id: Uuid) -> Option<Admission> {
    let entry = state.jobs.get_mut(&job_id)?;
    if entry.job.status != JobStatus::Queued {
        return None;
    }

    let Some(executor) = inner.executors.get(&entry.job.job_type) else {
        let error = format!("Unknown job type: {}", entry.job.job_type);
        warn!(job_id = %job_id, label = %entry.job.label, "{}", error);
        entry.job.finish(JobStatus::Failed, Some(error.clone()));
        return Some(Admission::Rejected(JobEvent::Failed {
            job_id,
            label: entry.job.label.clone(),
            error,
            timestamp: Utc::now(),
        }));
    };

    let now = Utc::now();
    entry.job.status = JobStatus::Running;
    entry.job.started_at = Some(now);
    entry.job.updated_at = now;
    let job = entry.job.clone();
    let token = entry.token.clone();
    state.running += 1;

    debug!(job_id = %job_id, job_type = %job.job_type, running = state.running, "Job started");
    Some(Admission::Start(job, token, executor))
}

async fn run(inner: Arc<Inner>, job: Job, token: CancellationToken, executor: Executor) {
    let job_id = job.id;
    let updater = JobUpdater {
        job_id,
        inner: inner.clone(),
        token,
    };

    let outcome = match AssertUnwindSafe(executor(job, updater)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("executor panicked: {}", panic_message(&*panic))),
    };

    settle(&inner, job_id, outcome);
    drain(&inner);
}

/// Record the executor's outcome unless the job already left `running`
fn settle(inner: &Inner, job_id: Uuid, outcome: anyhow::Result<Option<JobPatch>>) {
    let mut state = inner.state();
    let Some(entry) = state.jobs.get_mut(&job_id) else {
        return;
    };
    if entry.job.status != JobStatus::Running {
        debug!(job_id = %job_id, status = %entry.job.status, "Settle ignored for finished job");
        return;
    }

    let label = entry.job.label.clone();
    let event = match outcome {
        Ok(patch) => {
            if let Some(patch) = patch {
                entry.job.apply(patch);
            }
            entry.job.finish(JobStatus::Completed, None);
            info!(job_id = %job_id, label = %label, "Job completed");
            JobEvent::Completed {
                job_id,
                label,
                timestamp: Utc::now(),
            }
        }
        Err(e) => {
            let error = format!("{:#}", e);
            entry.job.finish(JobStatus::Failed, Some(error.clone()));
            warn!(job_id = %job_id, label = %label, error = %error, "Job failed");
            JobEvent::Failed {
                job_id,
                label,
                error,
                timestamp: Utc::now(),
            }
        }
    };
    state.running -= 1;
    inner.events.emit_lossy(event);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Progress callback handed to an executor
///
/// Every call checks that the job is still running; once the job has been
/// cancelled (or has finished) the call fails with [`Error::Cancelled`] and
/// the executor is expected to stop.
#[derive(Clone)]
pub struct JobUpdater {
    job_id: Uuid,
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl JobUpdater {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn update(&self, patch: JobPatch) -> Result<()> {
        let mut state = self.inner.state();
        let entry = state
            .jobs
            .get_mut(&self.job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", self.job_id)))?;
        if entry.job.status != JobStatus::Running {
            return Err(Error::Cancelled(format!(
                "job {} is {}",
                self.job_id, entry.job.status
            )));
        }

        let progress = patch.progress.clone();
        entry.job.apply(patch);
        if let Some(progress) = progress {
            self.inner.events.emit_lossy(JobEvent::Progress {
                job_id: self.job_id,
                label: entry.job.label.clone(),
                progress,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Report `{"done", "total", "item"}` progress
    pub fn progress(&self, done: usize, total: usize, item: &str) -> Result<()> {
        self.update(JobPatch::progress(json!({
            "done": done,
            "total": total,
            "item": item,
        })))
    }

    /// Cancelled when the job's label is cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl fmt::Debug for JobUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobUpdater")
            .field("job_id", &self.job_id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_terminal(queue: &JobQueue, job_id: Uuid) -> Job {
        for _ in 0..200 {
            if let Some(job) = queue.get_job(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_enqueue_runs_and_completes() {
        let mut executors = ExecutorRegistry::new();
        executors.register("echo", |job, _updater| async move {
            Ok(Some(JobPatch::progress(job.params)))
        });
        let queue = JobQueue::new(executors, EventBus::default());

        let id = queue.enqueue("echo", "book1", json!({"pages": ["pg001"]}));
        let job = wait_terminal(&queue, id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, Some(json!({"pages": ["pg001"]})));
        assert!(job.error.is_none());
        assert!(job.finished_at.is_some());
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_job_type_fails_without_slot() {
        let queue = JobQueue::new(ExecutorRegistry::new(), EventBus::default());
        let id = queue.enqueue("nope", "book1", json!({}));

        let job = queue.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Unknown job type: nope"));
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn test_executor_error_captured() {
        let mut executors = ExecutorRegistry::new();
        executors.register("fail", |_job, _updater| async {
            Err(anyhow::anyhow!("model returned garbage"))
        });
        let queue = JobQueue::new(executors, EventBus::default());

        let id = queue.enqueue("fail", "book1", json!({}));
        let job = wait_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("model returned garbage"));
    }

    #[tokio::test]
    async fn test_executor_panic_captured() {
        let mut executors = ExecutorRegistry::new();
        executors.register("boom", |_job, _updater| async {
            panic!("kaboom");
        });
        let queue = JobQueue::new(executors, EventBus::default());

        let id = queue.enqueue("boom", "book1", json!({}));
        let job = wait_terminal(&queue, id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("kaboom"));
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_twice_is_idempotent() {
        let mut executors = ExecutorRegistry::new();
        executors.register("hang", |_job, _updater| async {
            futures::future::pending::<()>().await;
            Ok(None)
        });
        let queue = JobQueue::new(executors, EventBus::default());
        queue.enqueue("hang", "book1", json!({}));

        assert_eq!(queue.cancel_by_label("book1"), 1);
        assert_eq!(queue.cancel_by_label("book1"), 0);
        assert_eq!(queue.cancel_by_label("other"), 0);
        assert_eq!(queue.active_count(), 0);
    }
}
