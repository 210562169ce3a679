//! Job, priority class and resource requirement definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Job identity
pub type JobId = Uuid;

/// A workload tracked by the job store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: JobId,
    /// Human-readable name
    pub name: String,
    /// Owning project
    pub project_id: String,
    /// Namespace the job's pods run in
    pub namespace: String,
    /// Current status
    pub status: JobStatus,
    /// Priority class name (also the queue tier label)
    pub priority_class: String,
    /// Snapshot of the priority class value taken at submission
    pub priority_value: i32,
    /// Number of whole GPUs required
    pub required_gpu: u32,
    /// Fractional MPS units required (0 for whole-GPU jobs)
    pub mps_units: u32,
    /// Node the job was placed on
    pub node: Option<String>,
    /// Job type, used to pick an executor
    pub job_type: JobType,
    /// Command line to run
    pub command: Vec<String>,
    /// Extra environment for the workload
    pub env: BTreeMap<String, String>,
    /// Number of replicas (multi-replica job types)
    pub replicas: u32,
    /// Reason for the last failure or preemption
    pub error_message: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Time the job started running
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job with default values
    pub fn new(name: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            project_id: String::new(),
            namespace: "default".to_string(),
            status: JobStatus::Pending,
            priority_class: String::new(),
            priority_value: 0,
            required_gpu: 0,
            mps_units: 0,
            node: None,
            job_type,
            command: Vec::new(),
            env: BTreeMap::new(),
            replicas: 1,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach a priority class, snapshotting its value
    pub fn with_priority(mut self, class: &PriorityClass) -> Self {
        self.priority_class = class.name.clone();
        self.priority_value = class.value;
        self
    }

    /// Set the required whole-GPU count
    pub fn with_gpus(mut self, count: u32) -> Self {
        self.required_gpu = count;
        self
    }

    /// Set the command line
    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Queue tier derived from the priority class label
    pub fn tier(&self) -> PriorityTier {
        PriorityTier::from_label(&self.priority_class)
    }

    /// Check if the job has finished, one way or another
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the queue
    Pending,
    /// Dispatched to an executor
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Evicted in favour of higher-priority work
    Preempted,
    /// Cancelled by a user or operator
    Cancelled,
}

impl JobStatus {
    /// Statuses a job never leaves
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Preempted,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Preempted => write!(f, "PREEMPTED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Declared job type; open-ended so new executors can be plugged in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobType(String);

impl JobType {
    /// Plain batch job
    pub const BATCH: &'static str = "batch";
    /// Multi-replica MPI job
    pub const MPI: &'static str = "mpi";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn batch() -> Self {
        Self::new(Self::BATCH)
    }

    pub fn mpi() -> Self {
        Self::new(Self::MPI)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Queue tier of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityTier {
    Low,
    Medium,
    High,
}

impl PriorityTier {
    /// "high" and "medium" map to their tiers, anything else is low
    pub fn from_label(label: &str) -> Self {
        match label {
            "high" => PriorityTier::High,
            "medium" => PriorityTier::Medium,
            _ => PriorityTier::Low,
        }
    }

    /// Heap weight of the tier
    pub fn weight(&self) -> u32 {
        match self {
            PriorityTier::High => 3,
            PriorityTier::Medium => 2,
            PriorityTier::Low => 1,
        }
    }
}

impl std::fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriorityTier::High => write!(f, "high"),
            PriorityTier::Medium => write!(f, "medium"),
            PriorityTier::Low => write!(f, "low"),
        }
    }
}

/// Named priority tier with an integer value; immutable reference data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityClass {
    pub name: String,
    /// Higher is more important
    pub value: i32,
    pub preemption_policy: PreemptionPolicy,
    pub description: String,
}

impl PriorityClass {
    pub fn new(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            value,
            preemption_policy: PreemptionPolicy::PreemptLowerPriority,
            description: String::new(),
        }
    }
}

/// Whether a class may evict lower-priority work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreemptionPolicy {
    PreemptLowerPriority,
    Never,
}

/// Resources requested by a workload that failed admission
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// CPU cores
    pub cpu: f64,
    /// Memory in bytes
    pub memory: u64,
    /// Whole GPUs
    pub gpu: u32,
    /// MPS units
    pub mps: u32,
    /// Priority value of the requester
    pub priority_value: i32,
    /// Requesting job, if any
    pub requested_by: Option<JobId>,
}

impl ResourceRequirement {
    /// Requirement derived from a job's declared resources
    pub fn for_job(job: &Job) -> Self {
        Self {
            gpu: job.required_gpu,
            mps: job.mps_units,
            priority_value: job.priority_value,
            requested_by: Some(job.id),
            ..Default::default()
        }
    }
}
