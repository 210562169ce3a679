//! gpusched-priority: Preemption for gpusched
//!
//! This crate decides which running jobs make room for more important work:
//! - The `Strategy` contract and decision types
//! - The default cumulative-GPU strategy and the tier-weight strategy
//! - `PriorityManager`, the registry with a switchable active strategy
//! - `PreemptionService`, which applies decisions to the job store

pub mod cumulative;
pub mod manager;
pub mod service;
pub mod strategy;
pub mod weight;

pub use cumulative::{CumulativeGpuStrategy, VictimOrder, CUMULATIVE_GPU_STRATEGY};
pub use manager::PriorityManager;
pub use service::{Evictor, PreemptionService};
pub use strategy::{PreemptionConfig, PreemptionDecision, Strategy};
pub use weight::{PriorityWeightStrategy, PRIORITY_WEIGHT_STRATEGY};
