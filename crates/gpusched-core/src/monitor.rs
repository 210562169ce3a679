//! Cluster resource metrics and the monitor contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{SchedError, SchedResult};

/// Point-in-time resource usage of the cluster or a single node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub total_cpu: f64,
    pub used_cpu: f64,
    /// Bytes
    pub total_memory: u64,
    /// Bytes
    pub used_memory: u64,
    pub total_gpu: u32,
    pub used_gpu: u32,
    pub available_mps: u32,
    pub timestamp: Option<DateTime<Utc>>,
    pub node_name: Option<String>,
    pub pod_count: u32,
    pub job_count: u32,
}

impl ResourceMetrics {
    /// CPU usage percentage
    pub fn cpu_usage_percent(&self) -> f64 {
        if self.total_cpu == 0.0 {
            return 0.0;
        }
        self.used_cpu / self.total_cpu * 100.0
    }

    /// Memory usage percentage
    pub fn memory_usage_percent(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.used_memory as f64 / self.total_memory as f64 * 100.0
    }

    /// GPU usage percentage
    pub fn gpu_usage_percent(&self) -> f64 {
        if self.total_gpu == 0 {
            return 0.0;
        }
        f64::from(self.used_gpu) / f64::from(self.total_gpu) * 100.0
    }

    /// True when CPU and memory have headroom and GPUs are either unmanaged
    /// (total of zero) or have headroom
    pub fn has_available_resources(&self) -> bool {
        self.used_cpu < self.total_cpu
            && self.used_memory < self.total_memory
            && (self.total_gpu == 0 || self.used_gpu < self.total_gpu)
    }
}

/// Resource monitor contract
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Cluster-wide metrics
    async fn get_metrics(&self) -> SchedResult<ResourceMetrics>;

    /// True when the cluster cannot admit more work
    async fn detect_resource_shortage(&self) -> SchedResult<bool>;

    /// Metrics of a single node
    async fn get_node_metrics(&self, node_name: &str) -> SchedResult<ResourceMetrics>;

    /// Start background collection
    async fn start(&self) -> SchedResult<()>;

    /// Stop background collection
    async fn stop(&self) -> SchedResult<()>;
}

/// Monitor fed by an external collector through [`SnapshotMonitor::record`]
pub struct SnapshotMonitor {
    cluster: RwLock<Option<ResourceMetrics>>,
    nodes: RwLock<HashMap<String, ResourceMetrics>>,
    running: AtomicBool,
}

impl SnapshotMonitor {
    pub fn new() -> Self {
        Self {
            cluster: RwLock::new(None),
            nodes: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Replace the cluster-wide snapshot
    pub async fn record(&self, mut metrics: ResourceMetrics) {
        metrics.timestamp.get_or_insert_with(Utc::now);
        debug!(
            cpu = metrics.cpu_usage_percent(),
            memory = metrics.memory_usage_percent(),
            gpu = metrics.gpu_usage_percent(),
            "Recorded cluster metrics"
        );
        *self.cluster.write().await = Some(metrics);
    }

    /// Replace the snapshot of one node
    pub async fn record_node(&self, node_name: &str, mut metrics: ResourceMetrics) {
        metrics.node_name = Some(node_name.to_string());
        metrics.timestamp.get_or_insert_with(Utc::now);
        self.nodes
            .write()
            .await
            .insert(node_name.to_string(), metrics);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for SnapshotMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Monitor for SnapshotMonitor {
    async fn get_metrics(&self) -> SchedResult<ResourceMetrics> {
        self.cluster
            .read()
            .await
            .clone()
            .ok_or_else(|| SchedError::Unavailable("no cluster metrics recorded yet".to_string()))
    }

    async fn detect_resource_shortage(&self) -> SchedResult<bool> {
        let metrics = self.get_metrics().await?;
        Ok(!metrics.has_available_resources())
    }

    async fn get_node_metrics(&self, node_name: &str) -> SchedResult<ResourceMetrics> {
        self.nodes
            .read()
            .await
            .get(node_name)
            .cloned()
            .ok_or_else(|| SchedError::Unavailable(format!("no metrics for node {}", node_name)))
    }

    async fn start(&self) -> SchedResult<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Resource monitor started");
        }
        Ok(())
    }

    async fn stop(&self) -> SchedResult<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Resource monitor stopped");
        }
        Ok(())
    }
}
