//! gpusched-scheduler: Priority dispatch for gpusched
//!
//! This crate decides which pending job runs next:
//! - Tier-weighted pending queue
//! - Timer-driven dispatch loop over the executor registry
//! - Per-project MPS quota tracking
//! - Reconciliation of RUNNING jobs against executor status

pub mod queue;
pub mod quota;
pub mod reconciler;
pub mod scheduler;

pub use queue::JobQueue;
pub use quota::QuotaTracker;
pub use reconciler::{FinishedJob, Reconciler};
pub use scheduler::{DispatchEvent, Scheduler, SchedulerState};
