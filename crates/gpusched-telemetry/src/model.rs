//! GPU usage records

use chrono::{DateTime, Utc};
use gpusched_core::JobId;
use serde::{Deserialize, Serialize};

/// One GPU of one pod at one instant; never updated once stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuUsageSnapshot {
    /// Store-assigned id, 0 until inserted
    pub id: u64,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub pod_name: String,
    pub pod_namespace: String,
    /// -1 when the backend did not report an index
    pub gpu_index: i32,
    pub gpu_uuid: String,
    pub gpu_memory_bytes: i64,
    pub gpu_utilization: f64,
    pub node: String,
    /// MPS units granted to the pod
    pub mps_virtual_units: u32,
    /// Physical GPU backing the MPS share, -1 if unknown
    pub mps_physical_gpu_index: i32,
}

impl GpuUsageSnapshot {
    /// Identity of the GPU within the job: `namespace/pod:index:uuid`
    pub fn gpu_key(&self) -> String {
        gpu_key(
            &self.pod_namespace,
            &self.pod_name,
            self.gpu_index,
            &self.gpu_uuid,
        )
    }
}

pub(crate) fn gpu_key(namespace: &str, pod: &str, gpu_index: i32, gpu_uuid: &str) -> String {
    format!("{}/{}:{}:{}", namespace, pod, gpu_index, gpu_uuid)
}

/// Usage of a finished job, computed once from all its snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuUsageSummary {
    pub job_id: JobId,
    pub total_gpu_seconds: f64,
    pub peak_memory_bytes: i64,
    pub avg_utilization: f64,
    /// Integer average
    pub avg_memory_bytes: i64,
    pub sample_count: usize,
    pub first_sample_at: Option<DateTime<Utc>>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

/// One page of a job's snapshots
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPage {
    pub snapshots: Vec<GpuUsageSnapshot>,
    /// All snapshots of the job, regardless of paging
    pub total: usize,
}
