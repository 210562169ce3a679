//! Executor trait definitions

use async_trait::async_trait;
use gpusched_core::{Job, JobId, JobStatus, JobType, SchedResult};

/// Backend capable of running one or more job types
#[async_trait]
pub trait Executor: Send + Sync {
    /// Launch a job
    async fn execute(&self, job: &Job) -> SchedResult<()>;

    /// Stop a launched job
    async fn cancel(&self, job_id: JobId) -> SchedResult<()>;

    /// Current status of a launched job
    async fn get_status(&self, job_id: JobId) -> SchedResult<JobStatus>;

    /// Output collected so far
    async fn get_logs(&self, job_id: JobId) -> SchedResult<String>;

    /// Stop tracking a job that has finished
    async fn release(&self, _job_id: JobId) -> SchedResult<()> {
        Ok(())
    }

    /// Check if this executor can run the given job type
    fn supports_type(&self, job_type: &JobType) -> bool;

    /// Get the executor name
    fn name(&self) -> &'static str;
}
