//! Integration tests for the job queue: ceiling, FIFO admission and
//! label cancellation racing executor settles

use bookmill_common::events::{EventBus, JobEvent, JobStatus};
use bookmill_common::Error;
use bookmill_pipeline::jobs::{
    ExecutorRegistry, Job, JobPatch, JobQueue, JobUpdater, CANCELLED_MESSAGE, MAX_CONCURRENT_JOBS,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use uuid::Uuid;

async fn wait_terminal(queue: &JobQueue, job_id: Uuid) -> Job {
    for _ in 0..400 {
        if let Some(job) = queue.get_job(job_id) {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} did not reach a terminal status", job_id);
}

fn hanging_executors() -> ExecutorRegistry {
    let mut executors = ExecutorRegistry::new();
    executors.register("hang", |_job, _updater| async {
        futures::future::pending::<()>().await;
        Ok(None)
    });
    executors
}

#[tokio::test]
async fn test_running_jobs_never_exceed_ceiling() {
    let queue = JobQueue::new(hanging_executors(), EventBus::default());
    let total = MAX_CONCURRENT_JOBS + 9;

    let ids: Vec<Uuid> = (0..total)
        .map(|_| {
            let id = queue.enqueue("hang", "big-book", json!({}));
            assert!(queue.running_count() <= MAX_CONCURRENT_JOBS);
            id
        })
        .collect();

    let running = ids
        .iter()
        .filter(|id| queue.get_job(**id).unwrap().status == JobStatus::Running)
        .count();
    let queued = ids
        .iter()
        .filter(|id| queue.get_job(**id).unwrap().status == JobStatus::Queued)
        .count();
    assert_eq!(running, MAX_CONCURRENT_JOBS);
    assert_eq!(queued, total - MAX_CONCURRENT_JOBS);

    assert_eq!(queue.cancel_by_label("big-book"), total);
    for id in &ids {
        let job = queue.get_job(*id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_MESSAGE));
    }
    assert_eq!(queue.running_count(), 0);
    assert_eq!(queue.active_count(), 0);
}

#[tokio::test]
async fn test_admission_is_fifo() {
    let gate = Arc::new(Semaphore::new(0));

    let mut executors = ExecutorRegistry::new();
    executors.register("quick", |_job, _updater| async { Ok(None) });
    let g = gate.clone();
    executors.register("block", move |_job, _updater| {
        let g = g.clone();
        async move {
            g.acquire().await?.forget();
            Ok::<_, anyhow::Error>(None)
        }
    });
    let queue = JobQueue::new(executors, EventBus::default());
    let mut events = queue.subscribe();

    // Fill every slot so the rest must wait in the queue
    let blockers: Vec<Uuid> = (0..MAX_CONCURRENT_JOBS)
        .map(|_| queue.enqueue("block", "book", json!({})))
        .collect();
    let waiting: Vec<Uuid> = (0..5)
        .map(|n| queue.enqueue("quick", "book", json!({ "n": n })))
        .collect();
    for id in &waiting {
        assert_eq!(queue.get_job(*id).unwrap().status, JobStatus::Queued);
    }

    gate.add_permits(MAX_CONCURRENT_JOBS);
    for id in blockers.iter().chain(waiting.iter()) {
        assert_eq!(wait_terminal(&queue, *id).await.status, JobStatus::Completed);
    }

    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let JobEvent::Started { job_id, .. } = event {
            if waiting.contains(&job_id) {
                started.push(job_id);
            }
        }
    }
    assert_eq!(started, waiting);
}

#[tokio::test]
async fn test_cancel_by_label_queued_and_running() {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobUpdater>();
    let mut executors = ExecutorRegistry::new();
    executors.register("capture", move |_job, updater| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(updater);
            futures::future::pending::<()>().await;
            Ok(None)
        }
    });
    executors.register("hang", |_job, _updater| async {
        futures::future::pending::<()>().await;
        Ok(None)
    });
    let queue = JobQueue::new(executors, EventBus::default());

    // Occupy all but one slot with another label's work
    let others: Vec<Uuid> = (0..MAX_CONCURRENT_JOBS - 1)
        .map(|_| queue.enqueue("hang", "other-book", json!({})))
        .collect();
    let running = queue.enqueue("capture", "doomed", json!({}));
    let queued = queue.enqueue("hang", "doomed", json!({}));

    assert_eq!(queue.get_job(running).unwrap().status, JobStatus::Running);
    assert_eq!(queue.get_job(queued).unwrap().status, JobStatus::Queued);
    let updater = rx.recv().await.expect("running executor reports its updater");
    assert!(updater.progress(1, 3, "pg001").is_ok());

    assert_eq!(queue.cancel_by_label("doomed"), 2);

    for id in [running, queued] {
        let job = queue.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_MESSAGE));
    }
    for id in &others {
        assert_eq!(queue.get_job(*id).unwrap().status, JobStatus::Running);
    }

    // Late progress from the cancelled executor is rejected
    assert!(updater.is_cancelled());
    let late = updater.update(JobPatch::progress(json!({"done": 2})));
    assert!(matches!(late, Err(Error::Cancelled(_))));
    let job = queue.get_job(running).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.progress, Some(json!({"done": 1, "total": 3, "item": "pg001"})));

    // The queued job never started
    assert!(queue.get_job(queued).unwrap().started_at.is_none());
    assert_eq!(queue.cancel_by_label("doomed"), 0);
}

#[tokio::test]
async fn test_settle_after_cancel_keeps_failed() {
    let gate = Arc::new(Notify::new());
    let mut executors = ExecutorRegistry::new();
    let g = gate.clone();
    executors.register("slow", move |_job, _updater| {
        let g = g.clone();
        async move {
            g.notified().await;
            Ok(Some(JobPatch::progress(json!({"done": 1}))))
        }
    });
    let queue = JobQueue::new(executors, EventBus::default());
    let mut events = queue.subscribe();

    let id = queue.enqueue("slow", "book", json!({}));
    assert_eq!(queue.cancel_by_label("book"), 1);

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = queue.get_job(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(job.progress, None);

    let mut terminal = 0;
    while let Ok(event) = events.try_recv() {
        if event.job_id() == id && event.is_terminal() {
            terminal += 1;
            assert!(matches!(event, JobEvent::Failed { ref error, .. } if error == CANCELLED_MESSAGE));
        }
    }
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn test_event_sequence_for_completed_job() {
    let mut executors = ExecutorRegistry::new();
    executors.register("steps", |_job, updater: JobUpdater| async move {
        updater.progress(1, 2, "pg001")?;
        updater.progress(2, 2, "pg002")?;
        Ok::<_, anyhow::Error>(None)
    });
    let queue = JobQueue::new(executors, EventBus::default());
    let mut events = queue.subscribe();

    let id = queue.enqueue("steps", "book", json!({}));
    let job = wait_terminal(&queue, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, Some(json!({"done": 2, "total": 2, "item": "pg002"})));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.event_type());
    }
    assert_eq!(kinds, vec!["Queued", "Started", "Progress", "Progress", "Completed"]);
}

#[tokio::test]
async fn test_update_after_completion_rejected() {
    let (tx, mut rx) = mpsc::unbounded_channel::<JobUpdater>();
    let mut executors = ExecutorRegistry::new();
    executors.register("leak", move |_job, updater| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(updater);
            Ok(None)
        }
    });
    let queue = JobQueue::new(executors, EventBus::default());

    let id = queue.enqueue("leak", "book", json!({}));
    let updater = rx.recv().await.unwrap();
    assert_eq!(wait_terminal(&queue, id).await.status, JobStatus::Completed);

    assert!(updater.progress(1, 1, "pg001").is_err());
    assert_eq!(queue.get_job(id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancellation_frees_slots_for_other_labels() {
    let mut executors = hanging_executors();
    executors.register("quick", |_job, _updater| async { Ok(None) });
    let queue = JobQueue::new(executors, EventBus::default());

    for _ in 0..MAX_CONCURRENT_JOBS {
        queue.enqueue("hang", "stuck", json!({}));
    }
    let waiting = queue.enqueue("quick", "next", json!({}));
    assert_eq!(queue.get_job(waiting).unwrap().status, JobStatus::Queued);

    queue.cancel_by_label("stuck");
    assert_eq!(wait_terminal(&queue, waiting).await.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_list_jobs_by_label_in_enqueue_order() {
    let queue = JobQueue::new(hanging_executors(), EventBus::default());
    let a = queue.enqueue("hang", "one", json!({}));
    queue.enqueue("hang", "two", json!({}));
    let c = queue.enqueue("hang", "one", json!({}));

    let ids: Vec<Uuid> = queue.list_jobs("one").iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![a, c]);
    assert!(queue.list_jobs("three").is_empty());
    queue.cancel_by_label("one");
    queue.cancel_by_label("two");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_job_stream_ends_with_one_terminal_event_under_cancel() {
    let mut executors = ExecutorRegistry::new();
    executors.register("chatty", |_job, updater: JobUpdater| async move {
        for done in 0..50 {
            updater.progress(done, 50, "pg001")?;
            tokio::task::yield_now().await;
        }
        Ok::<_, anyhow::Error>(None)
    });
    let queue = JobQueue::new(executors, EventBus::new(1 << 16));
    let mut events = queue.subscribe();

    let ids: Vec<Uuid> = (0..MAX_CONCURRENT_JOBS * 3)
        .map(|_| queue.enqueue("chatty", "racy", json!({})))
        .collect();

    // Cancel from another worker while executors settle and admit the backlog
    let canceller = {
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            queue.cancel_by_label("racy")
        })
    };
    canceller.await.unwrap();

    let mut finals = HashMap::new();
    for id in &ids {
        finals.insert(*id, wait_terminal(&queue, *id).await.status);
    }

    let mut streams: HashMap<Uuid, Vec<JobEvent>> = HashMap::new();
    while let Ok(event) = events.try_recv() {
        streams.entry(event.job_id()).or_default().push(event);
    }

    for id in &ids {
        let stream = &streams[id];
        assert_eq!(stream.first().map(|e| e.event_type()), Some("Queued"));

        let terminal: Vec<usize> = stream
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_terminal())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(terminal, vec![stream.len() - 1], "job {} events: {:?}", id, stream);

        let expected = match finals[id] {
            JobStatus::Completed => "Completed",
            _ => "Failed",
        };
        assert_eq!(stream[stream.len() - 1].event_type(), expected);
    }
}
