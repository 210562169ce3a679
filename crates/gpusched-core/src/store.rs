//! Job and quota store contracts with in-memory implementations

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{Job, JobId, JobStatus, ProjectMpsQuota, SchedError, SchedResult};

/// Persistent job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Jobs whose status is one of `statuses`
    async fn list_by_status(&self, statuses: &[JobStatus]) -> SchedResult<Vec<Job>>;

    /// Fetch a job by id
    async fn get(&self, id: JobId) -> SchedResult<Job>;

    /// Insert a new job
    async fn create(&self, job: Job) -> SchedResult<()>;

    /// Transition a job's status, recording an optional reason
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        reason: Option<&str>,
    ) -> SchedResult<()>;

    /// Transition a job only if its status is still `expected`
    ///
    /// Returns `false`, leaving the job untouched, when it has moved on.
    async fn update_status_if(
        &self,
        id: JobId,
        expected: JobStatus,
        status: JobStatus,
        reason: Option<&str>,
    ) -> SchedResult<bool>;

    /// Running jobs strictly less important than `priority_value`
    async fn list_running_below(&self, priority_value: i32) -> SchedResult<Vec<Job>> {
        let running = self.list_by_status(&[JobStatus::Running]).await?;
        Ok(running
            .into_iter()
            .filter(|j| j.priority_value < priority_value)
            .collect())
    }
}

#[derive(Default)]
struct JobArena {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
}

/// Job store backed by an arena of records and an id index
///
/// Callers always get clones; no live reference to a stored job escapes the lock.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<JobArena>,
}

impl JobArena {
    fn job_mut(&mut self, id: JobId) -> SchedResult<&mut Job> {
        let slot = *self
            .index
            .get(&id)
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))?;
        Ok(&mut self.jobs[slot])
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list_by_status(&self, statuses: &[JobStatus]) -> SchedResult<Vec<Job>> {
        let arena = self.inner.read().await;
        Ok(arena
            .jobs
            .iter()
            .filter(|j| statuses.contains(&j.status))
            .cloned()
            .collect())
    }

    async fn get(&self, id: JobId) -> SchedResult<Job> {
        let arena = self.inner.read().await;
        arena
            .index
            .get(&id)
            .map(|&slot| arena.jobs[slot].clone())
            .ok_or_else(|| SchedError::JobNotFound(id.to_string()))
    }

    async fn create(&self, job: Job) -> SchedResult<()> {
        let mut arena = self.inner.write().await;
        if arena.index.contains_key(&job.id) {
            return Err(SchedError::Conflict(format!("job {} already exists", job.id)));
        }
        let slot = arena.jobs.len();
        arena.index.insert(job.id, slot);
        arena.jobs.push(job);
        Ok(())
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        reason: Option<&str>,
    ) -> SchedResult<()> {
        let mut arena = self.inner.write().await;
        let job = arena.job_mut(id)?;
        apply_status(job, status, reason);
        Ok(())
    }

    async fn update_status_if(
        &self,
        id: JobId,
        expected: JobStatus,
        status: JobStatus,
        reason: Option<&str>,
    ) -> SchedResult<bool> {
        let mut arena = self.inner.write().await;
        let job = arena.job_mut(id)?;
        if job.status != expected {
            debug!(job_id = %id, expected = %expected, actual = %job.status, "Job status moved on");
            return Ok(false);
        }
        apply_status(job, status, reason);
        Ok(true)
    }
}

fn apply_status(job: &mut Job, status: JobStatus, reason: Option<&str>) {
    let now = Utc::now();
    if status == JobStatus::Running && job.started_at.is_none() {
        job.started_at = Some(now);
    }
    if status.is_terminal() {
        job.completed_at = Some(now);
    }
    if let Some(reason) = reason {
        job.error_message = Some(reason.to_string());
    }

    debug!(job_id = %job.id, from = %job.status, to = %status, "Job status updated");
    job.status = status;
}

/// Persistent MPS quota records
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Quota of a project, if one is configured
    async fn get_quota(&self, project_id: &str) -> SchedResult<Option<ProjectMpsQuota>>;

    /// Insert or replace a project's quota
    async fn put_quota(&self, quota: ProjectMpsQuota) -> SchedResult<()>;
}

/// In-memory quota store
#[derive(Default)]
pub struct MemoryQuotaStore {
    quotas: RwLock<HashMap<String, ProjectMpsQuota>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn get_quota(&self, project_id: &str) -> SchedResult<Option<ProjectMpsQuota>> {
        Ok(self.quotas.read().await.get(project_id).cloned())
    }

    async fn put_quota(&self, quota: ProjectMpsQuota) -> SchedResult<()> {
        self.quotas
            .write()
            .await
            .insert(quota.project_id.clone(), quota);
        Ok(())
    }
}
