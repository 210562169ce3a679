//! Preemption strategy contract and decision types

use async_trait::async_trait;
use gpusched_core::{JobId, PreemptionSettings, ResourceRequirement, SchedResult};
use serde::Serialize;
use std::time::Duration;

/// Knobs applied to every decision a strategy produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptionConfig {
    /// Time a victim is given to shut down
    pub grace_period: Duration,
    /// Ask victims to checkpoint before eviction
    pub enable_checkpoint: bool,
    /// Upper bound on victims per decision
    pub max_preemptions: usize,
    /// Notify owners of evicted jobs
    pub notify_users: bool,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(120),
            enable_checkpoint: true,
            max_preemptions: 5,
            notify_users: true,
        }
    }
}

impl From<&PreemptionSettings> for PreemptionConfig {
    fn from(settings: &PreemptionSettings) -> Self {
        Self {
            grace_period: Duration::from_secs(settings.grace_period_secs),
            enable_checkpoint: settings.enable_checkpoint,
            max_preemptions: settings.max_preemptions,
            notify_users: settings.notify_users,
        }
    }
}

/// Victims chosen for one resource requirement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreemptionDecision {
    /// Victims in eviction order
    pub jobs_to_preempt: Vec<JobId>,
    pub reason: String,
    /// Job the capacity is being freed for
    pub requested_by: Option<JobId>,
    pub grace_period: Option<Duration>,
    pub create_checkpoint: bool,
    pub notify_users: bool,
}

impl PreemptionDecision {
    /// Decision carrying `config`'s knobs for the given victims
    ///
    /// The victim list is truncated to `max_preemptions`.
    pub fn new(
        mut victims: Vec<JobId>,
        reason: impl Into<String>,
        req: &ResourceRequirement,
        config: &PreemptionConfig,
    ) -> Self {
        victims.truncate(config.max_preemptions);
        Self {
            jobs_to_preempt: victims,
            reason: reason.into(),
            requested_by: req.requested_by,
            grace_period: Some(config.grace_period),
            create_checkpoint: config.enable_checkpoint,
            notify_users: config.notify_users,
        }
    }

    /// Decision that evicts nothing
    pub fn none(req: &ResourceRequirement) -> Self {
        Self {
            requested_by: req.requested_by,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs_to_preempt.is_empty()
    }
}

/// Named victim-selection algorithm
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Registry key
    fn name(&self) -> &str;

    /// Choose victims for `req`; never touches cluster state
    async fn execute(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_config_from_settings() {
        let config = PreemptionConfig::from(&PreemptionSettings::default());
        assert_eq!(config, PreemptionConfig::default());
    }

    #[test]
    fn test_decision_caps_victims() {
        let config = PreemptionConfig {
            max_preemptions: 2,
            ..Default::default()
        };
        let req = ResourceRequirement {
            gpu: 4,
            requested_by: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let victims: Vec<JobId> = (0..4).map(|_| Uuid::new_v4()).collect();

        let decision = PreemptionDecision::new(victims.clone(), "test", &req, &config);
        assert_eq!(decision.jobs_to_preempt, victims[..2].to_vec());
        assert_eq!(decision.requested_by, req.requested_by);
        assert_eq!(decision.grace_period, Some(Duration::from_secs(120)));
        assert!(decision.create_checkpoint);
    }

    #[test]
    fn test_empty_decision() {
        let decision = PreemptionDecision::none(&ResourceRequirement::default());
        assert!(decision.is_empty());
        assert!(decision.grace_period.is_none());
    }
}
