//! Applies preemption decisions to the job store

use async_trait::async_trait;
use gpusched_core::{
    Job, JobId, JobStatus, JobStore, Monitor, ResourceRequirement, SchedError, SchedResult,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::manager::PriorityManager;
use crate::strategy::PreemptionDecision;

/// Cluster-side eviction of a preempted job's workload
///
/// Without one the service only records the PREEMPTED status.
#[async_trait]
pub trait Evictor: Send + Sync {
    async fn evict(&self, job: &Job, grace_period: Option<Duration>) -> SchedResult<()>;
}

pub struct PreemptionService {
    manager: Arc<PriorityManager>,
    jobs: Arc<dyn JobStore>,
    evictor: Option<Arc<dyn Evictor>>,
}

impl PreemptionService {
    pub fn new(manager: Arc<PriorityManager>, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            manager,
            jobs,
            evictor: None,
        }
    }

    pub fn with_evictor(mut self, evictor: Arc<dyn Evictor>) -> Self {
        self.evictor = Some(evictor);
        self
    }

    /// Decision from the active strategy, without applying it
    pub async fn preempt(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision> {
        self.manager.preempt(req).await
    }

    /// Choose victims for `req` and mark each one PREEMPTED
    ///
    /// Every victim must be RUNNING when the decision is checked; otherwise
    /// nothing is changed and `SchedError::Conflict` is returned. Each write is
    /// conditional on the job still being RUNNING, and a victim that finished in
    /// between is left out of the returned decision. A store error part-way
    /// leaves the victims already written PREEMPTED.
    pub async fn perform_preemption(
        &self,
        req: &ResourceRequirement,
    ) -> SchedResult<PreemptionDecision> {
        let mut decision = self.manager.preempt(req).await?;
        if decision.is_empty() {
            debug!("No victims selected");
            return Ok(decision);
        }

        let mut victims = Vec::with_capacity(decision.jobs_to_preempt.len());
        for id in &decision.jobs_to_preempt {
            let job = self.jobs.get(*id).await?;
            if job.status != JobStatus::Running {
                return Err(SchedError::Conflict(format!(
                    "job {} is {}, only RUNNING jobs can be preempted",
                    id, job.status
                )));
            }
            victims.push(job);
        }

        let mut preempted = Vec::with_capacity(victims.len());
        for job in &victims {
            let moved = self
                .jobs
                .update_status_if(
                    job.id,
                    JobStatus::Running,
                    JobStatus::Preempted,
                    Some(&decision.reason),
                )
                .await?;
            if !moved {
                warn!(job_id = %job.id, "Victim left RUNNING before preemption, skipped");
                continue;
            }
            info!(
                job_id = %job.id,
                requested_by = ?decision.requested_by,
                reason = %decision.reason,
                checkpoint = decision.create_checkpoint,
                notify = decision.notify_users,
                "Job preempted"
            );
            self.evict(job, &decision).await;
            preempted.push(job.id);
        }

        decision.jobs_to_preempt = preempted;
        Ok(decision)
    }

    async fn evict(&self, job: &Job, decision: &PreemptionDecision) {
        let Some(evictor) = &self.evictor else {
            debug!(job_id = %job.id, "No evictor configured, workload left to the cluster");
            return;
        };
        if let Err(e) = evictor.evict(job, decision.grace_period).await {
            warn!(job_id = %job.id, error = %e, "Failed to evict preempted job");
        }
    }

    /// Preempt for `req` only when `monitor` reports a shortage
    pub async fn ensure_capacity(
        &self,
        monitor: &dyn Monitor,
        req: &ResourceRequirement,
    ) -> SchedResult<Vec<JobId>> {
        if !monitor.detect_resource_shortage().await? {
            return Ok(Vec::new());
        }
        info!(
            gpu = req.gpu,
            mps = req.mps,
            priority_value = req.priority_value,
            "Resource shortage detected, preempting"
        );
        Ok(self.perform_preemption(req).await?.jobs_to_preempt)
    }
}
