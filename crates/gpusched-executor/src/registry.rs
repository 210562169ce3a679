//! Job type to executor mapping

use gpusched_core::{Job, JobStatus, JobType, SchedError, SchedResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::traits::Executor;

/// Registry that maps job types to executors
///
/// Registration is last-write-wins per job type.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<JobType, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a job type, replacing any previous one
    pub async fn register(&self, job_type: JobType, executor: Arc<dyn Executor>) {
        if !executor.supports_type(&job_type) {
            warn!(
                job_type = %job_type,
                executor = executor.name(),
                "Registering executor for a job type it does not claim to support"
            );
        }

        let previous = self
            .executors
            .write()
            .await
            .insert(job_type.clone(), executor.clone());

        info!(
            job_type = %job_type,
            executor = executor.name(),
            replaced = previous.is_some(),
            "Executor registered"
        );
    }

    /// Executor registered for a job type
    pub async fn get(&self, job_type: &JobType) -> Option<Arc<dyn Executor>> {
        self.executors.read().await.get(job_type).cloned()
    }

    /// Registered job types, sorted
    pub async fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.executors.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Run a job on the executor registered for its type
    ///
    /// Returns [`SchedError::ExecutorNotFound`] when no executor is registered,
    /// which callers must tell apart from an execution failure.
    pub async fn execute(&self, job: &Job) -> SchedResult<()> {
        let executor = self.executor_for(job).await?;

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            executor = executor.name(),
            "Delegating job to executor"
        );

        executor.execute(job).await
    }

    async fn executor_for(&self, job: &Job) -> SchedResult<Arc<dyn Executor>> {
        self.get(&job.job_type)
            .await
            .ok_or_else(|| SchedError::ExecutorNotFound(job.job_type.to_string()))
    }

    /// Status of a launched job as its executor sees it
    pub async fn get_status(&self, job: &Job) -> SchedResult<JobStatus> {
        self.executor_for(job).await?.get_status(job.id).await
    }

    /// Let the job's executor forget a finished job
    pub async fn release(&self, job: &Job) -> SchedResult<()> {
        self.executor_for(job).await?.release(job.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gpusched_core::JobId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingExecutor {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        async fn execute(&self, _job: &Job) -> SchedResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SchedError::Execution("launch failed".to_string()));
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
            self.name
        }
    }

    #[tokio::test]
    async fn test_execute_delegates_by_type() {
        let registry = ExecutorRegistry::new();
        let executor = CountingExecutor::new("counting", false);
        registry.register(JobType::batch(), executor.clone()).await;

        let job = Job::new("train", JobType::batch());
        registry.execute(&job).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_executor_is_distinct() {
        let registry = ExecutorRegistry::new();
        let job = Job::new("train", JobType::mpi());

        let err = registry.execute(&job).await.unwrap_err();
        assert!(matches!(err, SchedError::ExecutorNotFound(ref t) if t == "mpi"));
    }

    #[tokio::test]
    async fn test_execution_failure_is_not_not_found() {
        let registry = ExecutorRegistry::new();
        registry
            .register(JobType::batch(), CountingExecutor::new("failing", true))
            .await;

        let err = registry
            .execute(&Job::new("train", JobType::batch()))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Execution(_)));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_lookup_by_type() {
        let registry = ExecutorRegistry::new();
        registry
            .register(JobType::batch(), CountingExecutor::new("counting", false))
            .await;

        let batch = Job::new("train", JobType::batch());
        assert_eq!(registry.get_status(&batch).await.unwrap(), JobStatus::Running);
        registry.release(&batch).await.unwrap();

        let mpi = Job::new("allreduce", JobType::mpi());
        assert!(registry.get_status(&mpi).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = ExecutorRegistry::new();
        let first = CountingExecutor::new("first", false);
        let second = CountingExecutor::new("second", false);
        registry.register(JobType::batch(), first.clone()).await;
        registry.register(JobType::batch(), second.clone()).await;

        registry
            .execute(&Job::new("train", JobType::batch()))
            .await
            .unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.job_types().await, vec![JobType::batch()]);
    }
}
