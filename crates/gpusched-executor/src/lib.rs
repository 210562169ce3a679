//! gpusched-executor: Pluggable job execution backends
//!
//! This crate maps job types to execution backends:
//! - The `Executor` contract and the type-keyed registry
//! - Process-based executor for plain batch jobs
//! - MPI launcher for multi-replica jobs

pub mod mpi;
pub mod process;
pub mod registry;
pub mod traits;

pub use mpi::{MpiExecutor, MpiExecutorConfig};
pub use process::{ProcessExecutor, ProcessExecutorConfig};
pub use registry::ExecutorRegistry;
pub use traits::Executor;
