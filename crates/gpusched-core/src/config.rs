//! Configuration types for gpusched

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Dispatch loop configuration
    pub scheduler: SchedulerConfig,
    /// MPS accounting configuration
    pub mps: MpsSettings,
    /// Preemption configuration
    pub preemption: PreemptionSettings,
    /// GPU usage telemetry configuration
    pub telemetry: TelemetryConfig,
    /// Cluster API configuration
    pub cluster: ClusterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SchedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between dispatch ticks
    pub tick_interval_secs: u64,
    /// Seconds between checks of running jobs against their executors
    pub reconcile_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            reconcile_interval_secs: 10,
        }
    }
}

/// MPS accounting settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpsSettings {
    /// MPS units per whole GPU (informational, accounting uses the built-in constant)
    pub units_per_gpu: u32,
}

impl Default for MpsSettings {
    fn default() -> Self {
        Self {
            units_per_gpu: crate::MPS_UNITS_PER_GPU,
        }
    }
}

/// Preemption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreemptionSettings {
    /// Strategy used for victim selection
    pub active_strategy: String,
    /// Grace period given to victims, in seconds
    pub grace_period_secs: u64,
    /// Ask victims to checkpoint before eviction
    pub enable_checkpoint: bool,
    /// Upper bound on victims per decision
    pub max_preemptions: usize,
    /// Notify owners of evicted jobs
    pub notify_users: bool,
}

impl Default for PreemptionSettings {
    fn default() -> Self {
        Self {
            active_strategy: "cumulative-gpu".to_string(),
            grace_period_secs: 120,
            enable_checkpoint: true,
            max_preemptions: 5,
            notify_users: true,
        }
    }
}

/// GPU usage telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Prometheus base URL; collection is unavailable without it
    pub prometheus_url: Option<String>,
    /// Seconds between snapshot collections
    pub collect_interval_secs: u64,
    /// Seconds between retention sweeps
    pub cleanup_interval_secs: u64,
    /// Snapshot retention in seconds
    pub retention_secs: u64,
    /// Pod label carrying the job id
    pub job_label_key: String,
    /// Per-GPU memory metric name
    pub memory_metric: String,
    /// Per-GPU SM utilization metric name
    pub utilization_metric: String,
    /// Timeout for a single metrics query, in seconds
    pub query_timeout_secs: u64,
}

impl TelemetryConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            prometheus_url: None,
            collect_interval_secs: 30,
            cleanup_interval_secs: 24 * 60 * 60,
            retention_secs: 30 * 24 * 60 * 60, // 30 days
            job_label_key: "platform.job-id".to_string(),
            memory_metric: "flashsched_pod_gpu_mps_memory_bytes".to_string(),
            utilization_metric: "flashsched_pod_gpu_sm_utilization_ratio".to_string(),
            query_timeout_secs: 10,
        }
    }
}

/// Cluster API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Connect to the cluster at all
    pub enabled: bool,
    /// Explicit kubeconfig; in-cluster or ~/.kube/config otherwise
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kubeconfig: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Optional EnvFilter directive, e.g. "gpusched_telemetry=debug"
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filter: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.scheduler.tick_interval_secs, 5);
        assert_eq!(config.scheduler.reconcile_interval(), Duration::from_secs(10));
        assert_eq!(config.telemetry.collect_interval_secs, 30);
        assert_eq!(config.telemetry.retention(), Duration::from_secs(2_592_000));
        assert_eq!(config.preemption.active_strategy, "cumulative-gpu");
        assert_eq!(config.mps.units_per_gpu, 10);
    }

    #[test]
    fn test_partial_config_parse() {
        let toml_str = r#"
[scheduler]
tick_interval_secs = 2

[telemetry]
prometheus_url = "http://prometheus:9090"

[preemption]
active_strategy = "priority-weight"
max_preemptions = 3
"#;
        let config: DaemonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(2));
        assert_eq!(
            config.telemetry.prometheus_url.as_deref(),
            Some("http://prometheus:9090")
        );
        assert_eq!(config.telemetry.job_label_key, "platform.job-id");
        assert_eq!(config.preemption.max_preemptions, 3);
        assert!(config.preemption.enable_checkpoint);
        assert!(config.cluster.enabled);
    }

    #[test]
    fn test_from_file_missing() {
        let err = DaemonConfig::from_file(std::path::Path::new("/nonexistent/gpusched.toml"))
            .unwrap_err();
        assert!(matches!(err, crate::SchedError::Config(_)));
    }
}
