//! Background job scheduling
//!
//! [`JobQueue`] owns every job record, admits queued jobs in FIFO order up to
//! a fixed concurrency ceiling and cancels jobs by label. Executors are looked
//! up by job type in an [`ExecutorRegistry`] handed to the queue at
//! construction.

pub mod model;
pub mod queue;
pub mod registry;

pub use model::{Job, JobPatch};
pub use queue::{JobQueue, JobUpdater, CANCELLED_MESSAGE, MAX_CONCURRENT_JOBS};
pub use registry::{Executor, ExecutorFuture, ExecutorRegistry};
