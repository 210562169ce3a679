//! Dispatch loop
//!
//! A single consumer wakes on a fixed timer, pops at most one job per tick and
//! hands it to the executor registry.

use gpusched_core::{Job, JobId, JobStatus, JobStore, JobType, SchedError, SchedResult};
use gpusched_executor::ExecutorRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::JobQueue;

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Executor accepted the job; it is now RUNNING
    Started { job_id: JobId },
    /// Executor failed; the job is now FAILED
    Failed { job_id: JobId, error: String },
    /// No executor for the job type; status untouched
    Unsupported { job_id: JobId, job_type: JobType },
}

/// Observable scheduler state
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerState {
    pub running: bool,
    pub queue_depth: usize,
    pub dispatched: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Scheduler owning the pending-job queue and its dispatch loop
pub struct Scheduler {
    queue: JobQueue,
    registry: Arc<ExecutorRegistry>,
    jobs: Arc<dyn JobStore>,
    tick_interval: Duration,
    running: AtomicBool,
    dispatched: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        jobs: Arc<dyn JobStore>,
        tick_interval: Duration,
    ) -> Self {
        info!(
            tick_interval_ms = tick_interval.as_millis() as u64,
            "Scheduler initialized"
        );

        Self {
            queue: JobQueue::new(),
            registry,
            jobs,
            tick_interval,
            running: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        }
    }

    /// Add a job to the pending queue
    pub async fn enqueue_job(&self, job: Job) {
        debug!(
            job_id = %job.id,
            tier = %job.tier(),
            "Job enqueued"
        );
        self.queue.push(job).await;
    }

    /// Number of pending jobs
    pub async fn get_queue_size(&self) -> usize {
        self.queue.len().await
    }

    /// Check if the dispatch loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of loop state and counters
    pub async fn state(&self) -> SchedulerState {
        SchedulerState {
            running: self.is_running(),
            queue_depth: self.get_queue_size().await,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    /// Run the dispatch loop until `cancel` fires
    ///
    /// Each tick's outcome is forwarded to `events` when a channel is given.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        events: Option<mpsc::Sender<DispatchEvent>>,
    ) -> SchedResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedError::Conflict(
                "dispatch loop is already running".to_string(),
            ));
        }
        info!("Scheduler started");

        let mut ticker = interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(outcome) = self.process_queue().await else {
                        continue;
                    };
                    if let Some(tx) = &events {
                        if tx.send(outcome).await.is_err() {
                            debug!("Dispatch event receiver dropped");
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
        Ok(())
    }

    /// Pop and dispatch at most one job; `None` when the queue is empty
    pub async fn process_queue(&self) -> Option<DispatchEvent> {
        let job = self.queue.pop().await?;

        let outcome = match self.registry.execute(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, job_type = %job.job_type, "Job dispatched");
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                self.record_status(job.id, JobStatus::Running, None).await;
                DispatchEvent::Started { job_id: job.id }
            }
            Err(SchedError::ExecutorNotFound(job_type)) => {
                warn!(
                    job_id = %job.id,
                    job_type = %job_type,
                    "Job executor not found, leaving status unchanged"
                );
                self.skipped.fetch_add(1, Ordering::Relaxed);
                DispatchEvent::Unsupported {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job execution failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                let error = e.to_string();
                self.record_status(job.id, JobStatus::Failed, Some(&error))
                    .await;
                DispatchEvent::Failed {
                    job_id: job.id,
                    error,
                }
            }
        };

        Some(outcome)
    }

    async fn record_status(&self, job_id: JobId, status: JobStatus, reason: Option<&str>) {
        if let Err(e) = self.jobs.update_status(job_id, status, reason).await {
            warn!(
                job_id = %job_id,
                status = %status,
                error = %e,
                "Failed to persist job status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpusched_core::{MemoryJobStore, PriorityClass};
    use gpusched_executor::Executor;

    struct StubExecutor {
        fail: bool,
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, _job: &Job) -> SchedResult<()> {
            if self.fail {
                return Err(SchedError::Execution("image pull failed".to_string()));
            }
            Ok(())
        }

        async fn cancel(&self, _job_id: JobId) -> SchedResult<()> {
            Ok(())
        }

        async fn get_status(&self, _job_id: JobId) -> SchedResult<JobStatus> {
            Ok(JobStatus::Running)
        }

        async fn get_logs(&self, _job_id: JobId) -> SchedResult<String> {
            Ok(String::new())
        }

        fn supports_type(&self, job_type: &JobType) -> bool {
            job_type.as_str() == JobType::BATCH
        }

        fn name(&self) -> &'static str {
            "stub"
        }
    }

    async fn setup(fail: bool) -> (Scheduler, Arc<MemoryJobStore>) {
        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register(JobType::batch(), Arc::new(StubExecutor { fail }))
            .await;
        let store = Arc::new(MemoryJobStore::new());
        let scheduler = Scheduler::new(registry, store.clone(), Duration::from_secs(5));
        (scheduler, store)
    }

    async fn submit(scheduler: &Scheduler, store: &MemoryJobStore, job: Job) -> JobId {
        let id = job.id;
        store.create(job.clone()).await.unwrap();
        scheduler.enqueue_job(job).await;
        id
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (scheduler, _) = setup(false).await;
        assert!(scheduler.process_queue().await.is_none());
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_high_priority_dispatches_first() {
        let (scheduler, store) = setup(false).await;
        let low = Job::new("low", JobType::batch())
            .with_priority(&PriorityClass::new("low", 100))
            .with_gpus(2);
        let high = Job::new("high", JobType::batch())
            .with_priority(&PriorityClass::new("high", 1000))
            .with_gpus(3);
        let low_id = submit(&scheduler, &store, low).await;
        let high_id = submit(&scheduler, &store, high).await;

        let outcome = scheduler.process_queue().await.unwrap();
        assert_eq!(outcome, DispatchEvent::Started { job_id: high_id });
        assert_eq!(store.get(high_id).await.unwrap().status, JobStatus::Running);
        assert_eq!(store.get(low_id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.get_queue_size().await, 1);
    }

    #[tokio::test]
    async fn test_unsupported_type_leaves_status() {
        let (scheduler, store) = setup(false).await;
        let id = submit(&scheduler, &store, Job::new("mpi", JobType::mpi())).await;

        let outcome = scheduler.process_queue().await.unwrap();
        assert!(matches!(outcome, DispatchEvent::Unsupported { .. }));
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(scheduler.state().await.skipped, 1);
    }

    #[tokio::test]
    async fn test_execution_error_marks_failed() {
        let (scheduler, store) = setup(true).await;
        let id = submit(&scheduler, &store, Job::new("bad", JobType::batch())).await;

        let outcome = scheduler.process_queue().await.unwrap();
        assert!(matches!(outcome, DispatchEvent::Failed { .. }));
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("image pull failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_dispatches_one_job_per_tick() {
        let (scheduler, store) = setup(false).await;
        let scheduler = Arc::new(scheduler);
        let low_id = submit(
            &scheduler,
            &store,
            Job::new("low", JobType::batch()).with_priority(&PriorityClass::new("low", 1)),
        )
        .await;
        let high_id = submit(
            &scheduler,
            &store,
            Job::new("high", JobType::batch()).with_priority(&PriorityClass::new("high", 9)),
        )
        .await;

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel, Some(tx)).await })
        };

        let first = rx.recv().await.unwrap();
        assert_eq!(first, DispatchEvent::Started { job_id: high_id });
        assert!(scheduler.is_running());
        assert_eq!(scheduler.get_queue_size().await, 1);

        let second = rx.recv().await.unwrap();
        assert_eq!(second, DispatchEvent::Started { job_id: low_id });

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(!scheduler.is_running());

        let state = scheduler.state().await;
        assert_eq!(state.dispatched, 2);
        assert_eq!(state.queue_depth, 0);
    }
}
