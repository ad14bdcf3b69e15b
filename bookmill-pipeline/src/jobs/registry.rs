//! Job type to executor mapping

use super::model::{Job, JobPatch};
use super::queue::JobUpdater;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Future returned by an executor; an `Err` fails the job with its message
pub type ExecutorFuture = BoxFuture<'static, anyhow::Result<Option<JobPatch>>>;

/// Async function performing one pipeline step
pub type Executor = Arc<dyn Fn(Job, JobUpdater) -> ExecutorFuture + Send + Sync>;

/// Executors by job type
///
/// Built once and moved into the queue. Tests build their own instance.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Executor>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for `job_type`, replacing any previous one
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, executor: F) -> &mut Self
    where
        F: Fn(Job, JobUpdater) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<JobPatch>>> + Send + 'static,
    {
        let executor: Executor = Arc::new(move |job, updater| Box::pin(executor(job, updater)));
        self.executors.insert(job_type.into(), executor);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Executor> {
        self.executors.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.executors.contains_key(job_type)
    }

    /// Registered job types, sorted
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
