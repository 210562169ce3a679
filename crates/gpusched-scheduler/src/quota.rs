//! Per-project MPS quota tracking
//!
//! Read-modify-write of a project's quota happens under a lock keyed by the
//! project id, so concurrent admissions for the same project serialize while
//! different projects proceed in parallel.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gpusched_core::{Job, ProjectMpsQuota, QuotaStore, SchedError, SchedResult};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

type LockMap = Arc<DashMap<String, Weak<Mutex<()>>>>;

/// Held project lock; the project's entry is removed once no task holds or awaits it
struct ProjectLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    project_id: String,
    locks: LockMap,
}

impl Drop for ProjectLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Checked under the shard lock, so no waiter can upgrade in between
        self.locks
            .remove_if(&self.project_id, |_, weak| weak.strong_count() == 0);
    }
}

/// Async lock per project id, kept only while some task holds or awaits it
#[derive(Default)]
struct ProjectLocks {
    locks: LockMap,
}

impl ProjectLocks {
    fn handle(&self, project_id: &str) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(project_id.to_string()) {
                Entry::Occupied(occupied) => {
                    if let Some(lock) = occupied.get().upgrade() {
                        return lock;
                    }
                    occupied.remove();
                }
                Entry::Vacant(vacant) => {
                    let lock = Arc::new(Mutex::new(()));
                    vacant.insert(Arc::downgrade(&lock));
                    return lock;
                }
            }
        }
    }

    async fn acquire(&self, project_id: &str) -> ProjectLockGuard {
        let guard = self.handle(project_id).lock_owned().await;
        ProjectLockGuard {
            guard: Some(guard),
            project_id: project_id.to_string(),
            locks: self.locks.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Atomic allocate/release of MPS units over a [`QuotaStore`]
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    locks: ProjectLocks,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            locks: ProjectLocks::default(),
        }
    }

    async fn load(&self, project_id: &str) -> SchedResult<ProjectMpsQuota> {
        self.store.get_quota(project_id).await?.ok_or_else(|| {
            SchedError::QuotaExceeded(format!("project {} has no MPS quota", project_id))
        })
    }

    /// Set a project's total, keeping its current usage
    ///
    /// A total below the units already in use is refused.
    pub async fn set_total(&self, project_id: &str, total_mps_units: u32) -> SchedResult<()> {
        let _guard = self.locks.acquire(project_id).await;
        let mut quota = self
            .store
            .get_quota(project_id)
            .await?
            .unwrap_or_else(|| ProjectMpsQuota::new(project_id, 0));
        if total_mps_units < quota.used_mps_units {
            warn!(
                project_id,
                total_mps_units,
                used = quota.used_mps_units,
                "MPS quota below current usage refused"
            );
            return Err(SchedError::QuotaExceeded(format!(
                "project {} uses {} MPS units, cannot lower total to {}",
                project_id, quota.used_mps_units, total_mps_units
            )));
        }
        quota.total_mps_units = total_mps_units;
        self.store.put_quota(quota).await?;

        info!(project_id, total_mps_units, "Project MPS quota set");
        Ok(())
    }

    /// Units still free for a project
    pub async fn available(&self, project_id: &str) -> SchedResult<u32> {
        Ok(self.load(project_id).await?.available_mps())
    }

    /// Reserve `units` for a project, refusing when they do not fit
    pub async fn allocate(&self, project_id: &str, units: u32) -> SchedResult<()> {
        let guard = self.locks.acquire(project_id).await;
        let result = async {
            let mut quota = self.load(project_id).await?;
            quota.allocate(units)?;
            self.store.put_quota(quota).await
        }
        .await;
        drop(guard);

        match &result {
            Ok(()) => debug!(project_id, units, "MPS units allocated"),
            Err(e) => warn!(project_id, units, error = %e, "MPS allocation refused"),
        }
        result
    }

    /// Return `units` to a project; usage never drops below zero
    pub async fn release(&self, project_id: &str, units: u32) -> SchedResult<()> {
        let guard = self.locks.acquire(project_id).await;
        let result = async {
            let mut quota = self.load(project_id).await?;
            quota.release(units);
            self.store.put_quota(quota).await
        }
        .await;
        drop(guard);

        debug!(project_id, units, "MPS units released");
        result
    }

    /// Reserve the job's MPS units against its project
    pub async fn allocate_for_job(&self, job: &Job) -> SchedResult<()> {
        if job.mps_units == 0 {
            return Ok(());
        }
        self.allocate(&job.project_id, job.mps_units).await
    }

    /// Release the job's MPS units back to its project
    pub async fn release_for_job(&self, job: &Job) -> SchedResult<()> {
        if job.mps_units == 0 {
            return Ok(());
        }
        self.release(&job.project_id, job.mps_units).await
    }
}
