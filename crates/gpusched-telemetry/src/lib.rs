//! gpusched-telemetry: GPU usage accounting for gpusched
//!
//! This crate measures how much GPU time each job consumed:
//! - Periodic per-pod snapshots from a metrics backend (Prometheus)
//! - Pod discovery through the cluster API (Kubernetes)
//! - One usage summary per finished job, integrated from its snapshots
//! - Snapshot retention and the cancellable background loop

pub mod cluster;
pub mod metrics;
pub mod model;
pub mod service;
pub mod store;
pub mod summary;
pub mod task;

pub use cluster::{ClusterClient, KubeClusterClient, PodInfo, PodPhase};
pub use metrics::{MetricsBackend, PrometheusClient, Sample};
pub use model::{GpuUsageSnapshot, GpuUsageSummary, SnapshotPage};
pub use service::GpuUsageService;
pub use store::{GpuUsageStore, MemoryGpuUsageStore};
pub use summary::{compute_summary, median_interval};
pub use task::{run_telemetry, TelemetryEvent, TelemetrySchedule, TelemetryStage};
