//! gpusched-core: Core types and contracts for gpusched
//!
//! This crate provides the fundamental types used throughout the gpusched system:
//! - Job, priority class and resource requirement types
//! - GPU / MPS unit accounting and project quotas
//! - Resource metrics and the monitor contract
//! - Job and quota store contracts
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod monitor;
pub mod mps;
pub mod store;

pub use config::*;
pub use error::*;
pub use model::*;
pub use monitor::*;
pub use mps::*;
pub use store::*;
