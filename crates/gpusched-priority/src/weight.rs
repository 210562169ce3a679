//! Tier-weight strategy
//!
//! A job may only evict jobs of a strictly lower queue tier (high > medium >
//! everything else), regardless of the numeric priority values.

use async_trait::async_trait;
use gpusched_core::{
    convert_mps_to_gpu, Job, JobId, JobStatus, JobStore, PriorityTier, ResourceRequirement,
    SchedError, SchedResult,
};
use std::sync::Arc;
use tracing::debug;

use crate::strategy::{PreemptionConfig, PreemptionDecision, Strategy};

/// Registry name of [`PriorityWeightStrategy`]
pub const PRIORITY_WEIGHT_STRATEGY: &str = "priority-weight";

const REASON: &str = "Preempted by higher priority tier";

/// True iff `victim`'s tier weighs less than `requester`'s
pub fn outranks(requester: &Job, victim: &Job) -> bool {
    victim.tier().weight() < requester.tier().weight()
}

pub struct PriorityWeightStrategy {
    jobs: Arc<dyn JobStore>,
    config: PreemptionConfig,
}

impl PriorityWeightStrategy {
    pub fn new(jobs: Arc<dyn JobStore>, config: PreemptionConfig) -> Self {
        Self { jobs, config }
    }

    /// Check whether `requester_id` may evict the running job `victim_id`
    pub async fn can_preempt(&self, victim_id: JobId, requester_id: JobId) -> SchedResult<bool> {
        let victim = self.jobs.get(victim_id).await?;
        if victim.status != JobStatus::Running {
            return Err(SchedError::Conflict(format!(
                "job {} is {}, not RUNNING",
                victim_id, victim.status
            )));
        }
        let requester = self.jobs.get(requester_id).await?;
        Ok(outranks(&requester, &victim))
    }

    /// Running jobs `requester` outranks, cheapest first
    pub async fn check_preemption(&self, requester: &Job) -> SchedResult<Vec<Job>> {
        let mut victims: Vec<Job> = self
            .jobs
            .list_by_status(&[JobStatus::Running])
            .await?
            .into_iter()
            .filter(|j| j.id != requester.id && outranks(requester, j))
            .collect();
        victims.sort_by(|a, b| {
            a.tier()
                .weight()
                .cmp(&b.tier().weight())
                .then_with(|| a.priority_value.cmp(&b.priority_value))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        Ok(victims)
    }
}

#[async_trait]
impl Strategy for PriorityWeightStrategy {
    fn name(&self) -> &str {
        PRIORITY_WEIGHT_STRATEGY
    }

    async fn execute(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision> {
        // Without a requesting job there is no tier to compare against
        let Some(requester_id) = req.requested_by else {
            debug!("No requesting job, tier-weight strategy selects nothing");
            return Ok(PreemptionDecision::none(req));
        };
        let requester = self.jobs.get(requester_id).await?;
        if requester.tier() == PriorityTier::Low {
            return Ok(PreemptionDecision::none(req));
        }

        let needed = u64::from(req.gpu.max(convert_mps_to_gpu(req.mps)));
        let mut freed = 0u64;
        let mut victims = Vec::new();
        for job in self.check_preemption(&requester).await? {
            if freed >= needed {
                break;
            }
            freed += u64::from(job.required_gpu);
            victims.push(job.id);
        }

        debug!(
            job_id = %requester_id,
            needed_gpu = needed,
            freed_gpu = freed,
            "Tier-weight victim selection"
        );

        Ok(PreemptionDecision::new(victims, REASON, req, &self.config))
    }
}
