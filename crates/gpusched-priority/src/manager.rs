//! Strategy registry and active-strategy switch

use gpusched_core::{ResourceRequirement, SchedError, SchedResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::strategy::{PreemptionDecision, Strategy};

#[derive(Default)]
struct ManagerState {
    strategies: HashMap<String, Arc<dyn Strategy>>,
    active: Option<String>,
}

/// Holds every known strategy and routes decisions to the active one
#[derive(Default)]
pub struct PriorityManager {
    state: RwLock<ManagerState>,
}

impl PriorityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy under its own name (last write wins)
    ///
    /// The first strategy registered becomes active.
    pub async fn register_strategy(&self, strategy: Arc<dyn Strategy>) {
        let name = strategy.name().to_string();
        let mut state = self.state.write().await;
        state.strategies.insert(name.clone(), strategy);
        if state.active.is_none() {
            state.active = Some(name.clone());
        }
        info!(strategy = %name, "Preemption strategy registered");
    }

    /// Switch the active strategy; unknown names leave it unchanged
    pub async fn set_active_strategy(&self, name: &str) -> SchedResult<()> {
        let mut state = self.state.write().await;
        if !state.strategies.contains_key(name) {
            return Err(SchedError::StrategyNotFound(name.to_string()));
        }
        state.active = Some(name.to_string());
        info!(strategy = %name, "Active preemption strategy switched");
        Ok(())
    }

    pub async fn active_strategy(&self) -> Option<String> {
        self.state.read().await.active.clone()
    }

    /// Registered strategy names, sorted
    pub async fn strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.strategies.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ask the active strategy for a decision
    pub async fn preempt(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision> {
        let strategy = {
            let state = self.state.read().await;
            let name = state
                .active
                .as_deref()
                .ok_or_else(|| SchedError::StrategyNotFound("no active strategy".to_string()))?;
            state
                .strategies
                .get(name)
                .cloned()
                .ok_or_else(|| SchedError::StrategyNotFound(name.to_string()))?
        };

        let decision = strategy.execute(req).await?;
        debug!(
            strategy = strategy.name(),
            victims = decision.jobs_to_preempt.len(),
            "Preemption decision made"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Strategy for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, req: &ResourceRequirement) -> SchedResult<PreemptionDecision> {
            Ok(PreemptionDecision {
                reason: self.0.to_string(),
                ..PreemptionDecision::none(req)
            })
        }
    }

    #[tokio::test]
    async fn test_no_strategy() {
        let manager = PriorityManager::new();
        let err = manager.preempt(&ResourceRequirement::default()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_first_registered_is_active() {
        let manager = PriorityManager::new();
        manager.register_strategy(Arc::new(Named("a"))).await;
        manager.register_strategy(Arc::new(Named("b"))).await;

        assert_eq!(manager.active_strategy().await.as_deref(), Some("a"));
        assert_eq!(manager.strategies().await, vec!["a", "b"]);
        let decision = manager.preempt(&ResourceRequirement::default()).await.unwrap();
        assert_eq!(decision.reason, "a");
    }

    #[tokio::test]
    async fn test_switch_strategy() {
        let manager = PriorityManager::new();
        manager.register_strategy(Arc::new(Named("a"))).await;
        manager.register_strategy(Arc::new(Named("b"))).await;

        manager.set_active_strategy("b").await.unwrap();
        let decision = manager.preempt(&ResourceRequirement::default()).await.unwrap();
        assert_eq!(decision.reason, "b");
    }

    #[tokio::test]
    async fn test_switch_to_unknown_keeps_active() {
        let manager = PriorityManager::new();
        manager.register_strategy(Arc::new(Named("a"))).await;

        let err = manager.set_active_strategy("missing").await.unwrap_err();
        assert!(matches!(err, SchedError::StrategyNotFound(_)));
        assert_eq!(manager.active_strategy().await.as_deref(), Some("a"));
    }
}
