//! Error types for gpusched

use thiserror::Error;

/// Main error type for gpusched
#[derive(Error, Debug)]
pub enum SchedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Preemption strategy not registered
    #[error("Strategy not found: {0}")]
    StrategyNotFound(String),

    /// No executor registered for the job type
    #[error("Executor not found for job type: {0}")]
    ExecutorNotFound(String),

    /// A required collaborator (metrics backend, cluster client) is not configured
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Part of a unit of work failed; the rest was processed
    #[error("Partial failure: {0}")]
    PartialFailure(String),

    /// Operation conflicts with the current state of the job
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Quota exceeded
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Executor failed to run a job
    #[error("Execution error: {0}")]
    Execution(String),

    /// Metrics backend error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Cluster API error
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Work aborted by its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedError {
    /// True for the not-found family (unknown job, strategy or executor type)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedError::JobNotFound(_)
                | SchedError::StrategyNotFound(_)
                | SchedError::ExecutorNotFound(_)
        )
    }
}

/// Result type for gpusched operations
pub type SchedResult<T> = Result<T, SchedError>;

impl From<toml::de::Error> for SchedError {
    fn from(err: toml::de::Error) -> Self {
        SchedError::Config(err.to_string())
    }
}
