//! Default strategy: evict the cheapest prefix of lower-priority running jobs

use async_trait::async_trait;
use gpusched_core::{convert_mps_to_gpu, Job, JobStore, ResourceRequirement, SchedResult};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::strategy::{PreemptionConfig, PreemptionDecision, Strategy};

/// Registry name of [`CumulativeGpuStrategy`]
pub const CUMULATIVE_GPU_STRATEGY: &str = "cumulative-gpu";

const REASON: &str = "High priority task resource requirement";

/// Order in which equally eligible victims are considered
///
/// Both variants put lower priority values first; they differ on ties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VictimOrder {
    /// Newest job of a tier goes first, so long-running work survives
    #[default]
    NewestFirst,
    /// Oldest job of a tier goes first
    OldestFirst,
}

impl VictimOrder {
    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let by_priority = a.priority_value.cmp(&b.priority_value);
        match self {
            VictimOrder::NewestFirst => by_priority.then_with(|| b.created_at.cmp(&a.created_at)),
            VictimOrder::OldestFirst => by_priority.then_with(|| a.created_at.cmp(&b.created_at)),
        }
    }
}

/// Victim selection over a running-sum of GPU footprints
///
/// Candidates are RUNNING jobs with a priority value strictly below the
/// requester's. Walking them in [`VictimOrder`], every job whose cumulative
/// GPU count stays within `requested + largest candidate footprint` is taken.
pub struct CumulativeGpuStrategy {
    jobs: Arc<dyn JobStore>,
    config: PreemptionConfig,
    order: VictimOrder,
}

impl CumulativeGpuStrategy {
    pub fn new(jobs: Arc<dyn JobStore>, config: PreemptionConfig) -> Self {
        Self {
            jobs,
            config,
            order: VictimOrder::default(),
        }
    }

    /// Replace the tie-break comparator
    pub fn with_order(mut self, order: VictimOrder) -> Self {
        self.order = order;
        self
    }

    /// GPUs the requirement needs, counting MPS units as whole GPUs
    fn requested_gpus(req: &ResourceRequirement) -> u32 {
        req.gpu.max(convert_mps_to_gpu(req.mps))
    }
}

/// Prefix of `candidates` (already ordered) whose running GPU sum stays within the threshold
pub fn select_victims(candidates: &[Job], requested_gpu: u32) -> Vec<&Job> {
    let headroom = candidates
        .iter()
        .map(|j| j.required_gpu)
        .max()
        .unwrap_or(0);
    let threshold = u64::from(requested_gpu) + u64::from(headroom);

    let mut cumulative = 0u64;
    candidates
        .iter()
        .take_while(|job| {
            cumulative += u64::from(job.required_gpu);
            cumulative <= threshold
        })
        .collect()
}

#[async_trait]
impl Strategy for CumulativeGpuStrategy {
    fn name(&self) -> &str {
        CUMULATIVE_GPU_STRATEGY
    }

    async fn execute(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision> {
        let requested = Self::requested_gpus(req);
        if requested == 0 {
            return Ok(PreemptionDecision::none(req));
        }

        let mut candidates = self.jobs.list_running_below(req.priority_value).await?;
        candidates.sort_by(|a, b| self.order.compare(a, b));

        let victims: Vec<_> = select_victims(&candidates, requested)
            .into_iter()
            .map(|j| j.id)
            .collect();

        debug!(
            requested_gpu = requested,
            candidates = candidates.len(),
            victims = victims.len(),
            "Cumulative victim selection"
        );

        Ok(PreemptionDecision::new(victims, REASON, req, &self.config))
    }
}
