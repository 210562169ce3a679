//! Snapshot collection, summary computation and retention

use chrono::{DateTime, Utc};
use gpusched_core::{
    convert_gpu_to_mps, JobId, JobStatus, JobStore, SchedError, SchedResult, TelemetryConfig,
};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, PodInfo};
use crate::metrics::{pod_metric_query, MetricsBackend, Sample};
use crate::model::{gpu_key, GpuUsageSnapshot, GpuUsageSummary, SnapshotPage};
use crate::store::GpuUsageStore;
use crate::summary::compute_summary;

async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = SchedResult<T>>,
) -> SchedResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SchedError::Cancelled("telemetry cycle".to_string())),
        result = work => result,
    }
}

/// GPU usage telemetry over the job store, a metrics backend and the cluster
pub struct GpuUsageService {
    jobs: Arc<dyn JobStore>,
    usage: Arc<dyn GpuUsageStore>,
    metrics: Option<Arc<dyn MetricsBackend>>,
    cluster: Option<Arc<dyn ClusterClient>>,
    job_label_key: String,
    memory_metric: String,
    utilization_metric: String,
}

impl GpuUsageService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        usage: Arc<dyn GpuUsageStore>,
        config: &TelemetryConfig,
    ) -> Self {
        Self {
            jobs,
            usage,
            metrics: None,
            cluster: None,
            job_label_key: config.job_label_key.clone(),
            memory_metric: config.memory_metric.clone(),
            utilization_metric: config.utilization_metric.clone(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsBackend>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterClient>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Sample every running job's pods and store the results as one batch
    ///
    /// Returns the number of snapshots written. Pods and jobs that fail are
    /// logged and skipped; a cancelled cycle writes nothing.
    pub async fn collect_snapshots(&self, cancel: &CancellationToken) -> SchedResult<usize> {
        let metrics = self
            .metrics
            .as_deref()
            .ok_or_else(|| SchedError::Unavailable("metrics backend not configured".to_string()))?;
        let cluster = self
            .cluster
            .as_deref()
            .ok_or_else(|| SchedError::Unavailable("cluster client not configured".to_string()))?;

        let jobs = self.jobs.list_by_status(&[JobStatus::Running]).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut batch = Vec::new();
        for job in &jobs {
            if job.namespace.is_empty() {
                continue;
            }
            let selector = format!("{}={}", self.job_label_key, job.id);
            let pods = match cancellable(cancel, cluster.list_pods(&job.namespace, &selector)).await
            {
                Ok(pods) => pods,
                Err(e @ SchedError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to list job pods");
                    continue;
                }
            };
            if pods.is_empty() {
                warn!(job_id = %job.id, namespace = %job.namespace, "No pods found for job");
                continue;
            }

            for pod in &pods {
                match self.collect_pod(metrics, job.id, pod, cancel).await {
                    Ok(snapshots) => batch.extend(snapshots),
                    Err(e @ SchedError::Cancelled(_)) => return Err(e),
                    Err(e) => {
                        warn!(
                            job_id = %job.id,
                            pod = %pod.name,
                            error = %e,
                            "Failed to collect pod snapshots"
                        );
                    }
                }
            }
        }

        let count = batch.len();
        self.usage.insert_snapshots(batch).await?;
        debug!(jobs = jobs.len(), snapshots = count, "Snapshot collection finished");
        Ok(count)
    }

    async fn collect_pod(
        &self,
        metrics: &dyn MetricsBackend,
        job_id: JobId,
        pod: &PodInfo,
        cancel: &CancellationToken,
    ) -> SchedResult<Vec<GpuUsageSnapshot>> {
        if pod.phase.is_terminal() {
            return Ok(Vec::new());
        }

        let timestamp = Utc::now();
        let memory = self
            .query_pod(metrics, &self.memory_metric, pod, timestamp, cancel)
            .await?;
        let utilization = self
            .query_pod(metrics, &self.utilization_metric, pod, timestamp, cancel)
            .await?;
        if memory.is_none() && utilization.is_none() {
            return Err(SchedError::PartialFailure(
                "both pod GPU metrics unavailable".to_string(),
            ));
        }

        let mps_units = convert_gpu_to_mps(pod.gpu_request);
        let mut merged: BTreeMap<String, GpuUsageSnapshot> = BTreeMap::new();
        let mut merge = |sample: &Sample, is_utilization: bool| {
            let parsed_index = sample
                .label("gpu_index")
                .and_then(|raw| raw.parse::<i32>().ok());
            let gpu_index = parsed_index.unwrap_or(-1);
            let gpu_uuid = sample.label("gpu_uuid").unwrap_or_default().to_string();

            let entry = merged
                .entry(gpu_key(&pod.namespace, &pod.name, gpu_index, &gpu_uuid))
                .or_insert_with(|| GpuUsageSnapshot {
                    id: 0,
                    job_id,
                    timestamp,
                    pod_name: pod.name.clone(),
                    pod_namespace: pod.namespace.clone(),
                    gpu_index,
                    gpu_uuid: gpu_uuid.clone(),
                    gpu_memory_bytes: 0,
                    gpu_utilization: 0.0,
                    node: sample
                        .label("node")
                        .map(str::to_string)
                        .unwrap_or_else(|| pod.node_name.clone()),
                    mps_virtual_units: mps_units,
                    mps_physical_gpu_index: parsed_index.unwrap_or(-1),
                });

            if is_utilization {
                entry.gpu_utilization += sample.value;
            } else {
                entry.gpu_memory_bytes += sample.value as i64;
            }
        };

        for sample in memory.iter().flatten() {
            merge(sample, false);
        }
        for sample in utilization.iter().flatten() {
            merge(sample, true);
        }

        Ok(merged.into_values().collect())
    }

    /// Run one pod metric query; a backend failure is logged and reported as `None`
    async fn query_pod(
        &self,
        metrics: &dyn MetricsBackend,
        metric: &str,
        pod: &PodInfo,
        at: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> SchedResult<Option<Vec<Sample>>> {
        let expr = pod_metric_query(metric, &pod.namespace, &pod.name);
        match cancellable(cancel, metrics.query(&expr, at)).await {
            Ok(samples) => Ok(Some(samples)),
            Err(e @ SchedError::Cancelled(_)) => Err(e),
            Err(e) => {
                warn!(
                    metric,
                    pod = %pod.name,
                    namespace = %pod.namespace,
                    error = %e,
                    "Pod GPU metric query failed"
                );
                Ok(None)
            }
        }
    }

    /// Write a summary for every terminal job that lacks one
    ///
    /// Returns the number of summaries written; running it again is a no-op.
    pub async fn compute_missing_summaries(&self, cancel: &CancellationToken) -> SchedResult<usize> {
        let jobs = self.jobs.list_by_status(&JobStatus::TERMINAL).await?;

        let mut written = 0;
        for job in &jobs {
            if cancel.is_cancelled() {
                return Err(SchedError::Cancelled("summary pass".to_string()));
            }
            if self.usage.get_summary(job.id).await?.is_some() {
                continue;
            }

            let snapshots = match self.usage.list_all_snapshots_by_job(job.id).await {
                Ok(snapshots) => snapshots,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to load job snapshots");
                    continue;
                }
            };
            let Some(summary) = compute_summary(job.id, &snapshots, Utc::now()) else {
                continue;
            };

            debug!(
                job_id = %job.id,
                gpu_seconds = summary.total_gpu_seconds,
                samples = summary.sample_count,
                "GPU usage summary computed"
            );
            self.usage.upsert_summary(summary).await?;
            written += 1;
        }

        if written > 0 {
            info!(summaries = written, "GPU usage summaries written");
        }
        Ok(written)
    }

    /// Delete snapshots older than `max_age`
    pub async fn cleanup_snapshots(&self, max_age: Duration) -> SchedResult<usize> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| SchedError::Config(format!("invalid retention: {}", e)))?;
        let cutoff = Utc::now() - max_age;

        let removed = self.usage.delete_snapshots_before(cutoff).await?;
        info!(removed, cutoff = %cutoff, "Old GPU usage snapshots removed");
        Ok(removed)
    }

    pub async fn list_snapshots(
        &self,
        job_id: JobId,
        limit: i64,
        offset: i64,
    ) -> SchedResult<SnapshotPage> {
        self.usage.list_snapshots_by_job(job_id, limit, offset).await
    }

    pub async fn get_summary(&self, job_id: JobId) -> SchedResult<Option<GpuUsageSummary>> {
        self.usage.get_summary(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PodPhase;
    use crate::store::MemoryGpuUsageStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use gpusched_core::{Job, JobType, MemoryJobStore};
    use std::collections::HashMap;

    /// Answers queries by metric name prefix; missing entries fail
    #[derive(Default)]
    struct FakeMetrics {
        series: HashMap<String, Vec<Sample>>,
    }

    impl FakeMetrics {
        fn with(mut self, metric: &str, samples: Vec<Sample>) -> Self {
            self.series.insert(metric.to_string(), samples);
            self
        }
    }

    #[async_trait]
    impl MetricsBackend for FakeMetrics {
        async fn query(&self, expr: &str, _at: DateTime<Utc>) -> SchedResult<Vec<Sample>> {
            let metric = expr.split('{').next().unwrap_or_default();
            let pod = expr
                .split("pod_name=\"")
                .nth(1)
                .and_then(|rest| rest.split('"').next())
                .unwrap_or_default();
            self.series
                .get(&format!("{}/{}", metric, pod))
                .cloned()
                .ok_or_else(|| SchedError::Metrics(format!("no series for {}", expr)))
        }
    }

    struct FakeCluster {
        pods: Vec<PodInfo>,
    }

    #[async_trait]
    impl ClusterClient for FakeCluster {
        async fn list_pods(&self, namespace: &str, _selector: &str) -> SchedResult<Vec<PodInfo>> {
            Ok(self
                .pods
                .iter()
                .filter(|p| p.namespace == namespace)
                .cloned()
                .collect())
        }
    }

    fn sample(gpu_index: Option<&str>, uuid: &str, value: f64) -> Sample {
        let mut labels = BTreeMap::from([("gpu_uuid".to_string(), uuid.to_string())]);
        if let Some(idx) = gpu_index {
            labels.insert("gpu_index".to_string(), idx.to_string());
        }
        Sample { labels, value }
    }

    fn pod(name: &str, phase: PodPhase) -> PodInfo {
        PodInfo {
            name: name.to_string(),
            namespace: "ml".to_string(),
            phase,
            node_name: "gpu-node-1".to_string(),
            gpu_request: 1,
        }
    }

    const MEM: &str = "flashsched_pod_gpu_mps_memory_bytes";
    const UTIL: &str = "flashsched_pod_gpu_sm_utilization_ratio";

    async fn running_job(store: &MemoryJobStore) -> Job {
        let mut job = Job::new("train", JobType::batch());
        job.namespace = "ml".to_string();
        job.status = JobStatus::Running;
        store.create(job.clone()).await.unwrap();
        job
    }

    fn service(
        jobs: Arc<MemoryJobStore>,
        usage: Arc<MemoryGpuUsageStore>,
        metrics: FakeMetrics,
        pods: Vec<PodInfo>,
    ) -> GpuUsageService {
        GpuUsageService::new(jobs, usage, &TelemetryConfig::default())
            .with_metrics(Arc::new(metrics))
            .with_cluster(Arc::new(FakeCluster { pods }))
    }

    #[tokio::test]
    async fn test_collect_requires_collaborators() {
        let service = GpuUsageService::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryGpuUsageStore::new()),
            &TelemetryConfig::default(),
        );
        let err = service
            .collect_snapshots(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_collect_merges_series_per_gpu() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        let job = running_job(&jobs).await;
        let metrics = FakeMetrics::default()
            .with(
                &format!("{}/worker-0", MEM),
                vec![
                    sample(Some("0"), "GPU-a", 100.0),
                    sample(Some("0"), "GPU-a", 50.0),
                    sample(None, "GPU-x", 10.0),
                ],
            )
            .with(
                &format!("{}/worker-0", UTIL),
                vec![sample(Some("0"), "GPU-a", 0.25)],
            );
        let service = service(
            jobs,
            usage.clone(),
            metrics,
            vec![pod("worker-0", PodPhase::Running)],
        );

        let written = service
            .collect_snapshots(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 2);

        let page = service.list_snapshots(job.id, 0, 0).await.unwrap();
        let by_uuid: HashMap<_, _> = page
            .snapshots
            .iter()
            .map(|s| (s.gpu_uuid.clone(), s.clone()))
            .collect();

        let known = &by_uuid["GPU-a"];
        assert_eq!(known.gpu_memory_bytes, 150);
        assert_eq!(known.gpu_utilization, 0.25);
        assert_eq!(known.gpu_index, 0);
        assert_eq!(known.mps_physical_gpu_index, 0);
        assert_eq!(known.mps_virtual_units, 10);
        assert_eq!(known.node, "gpu-node-1");

        let unknown = &by_uuid["GPU-x"];
        assert_eq!(unknown.gpu_index, -1);
        assert_eq!(unknown.mps_physical_gpu_index, -1);
    }

    #[tokio::test]
    async fn test_memory_failure_keeps_utilization() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        let job = running_job(&jobs).await;
        let metrics = FakeMetrics::default().with(
            &format!("{}/worker-0", UTIL),
            vec![sample(Some("1"), "GPU-b", 0.8)],
        );
        let service = service(
            jobs,
            usage,
            metrics,
            vec![pod("worker-0", PodPhase::Running)],
        );

        service
            .collect_snapshots(&CancellationToken::new())
            .await
            .unwrap();
        let page = service.list_snapshots(job.id, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.snapshots[0].gpu_memory_bytes, 0);
        assert_eq!(page.snapshots[0].gpu_utilization, 0.8);
    }

    #[tokio::test]
    async fn test_both_metrics_failing_drops_only_that_pod() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        let job = running_job(&jobs).await;
        let metrics = FakeMetrics::default().with(
            &format!("{}/worker-1", MEM),
            vec![sample(Some("0"), "GPU-c", 64.0)],
        );
        let service = service(
            jobs,
            usage,
            metrics,
            vec![
                pod("worker-0", PodPhase::Running),
                pod("worker-1", PodPhase::Running),
                pod("worker-2", PodPhase::Succeeded),
            ],
        );

        let written = service
            .collect_snapshots(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 1);
        let page = service.list_snapshots(job.id, 10, 0).await.unwrap();
        assert_eq!(page.snapshots[0].pod_name, "worker-1");
    }

    #[tokio::test]
    async fn test_cancelled_cycle_writes_nothing() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        running_job(&jobs).await;
        let metrics = FakeMetrics::default().with(
            &format!("{}/worker-0", UTIL),
            vec![sample(Some("0"), "GPU-a", 0.5)],
        );
        let service = service(
            jobs,
            usage.clone(),
            metrics,
            vec![pod("worker-0", PodPhase::Running)],
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = service.collect_snapshots(&cancel).await.unwrap_err();
        assert!(matches!(err, SchedError::Cancelled(_)));
        assert_eq!(usage.snapshot_count().await, 0);
    }

    async fn finished_job_with_samples(
        jobs: &MemoryJobStore,
        usage: &MemoryGpuUsageStore,
        status: JobStatus,
    ) -> JobId {
        let mut job = Job::new("done", JobType::batch());
        job.status = status;
        jobs.create(job.clone()).await.unwrap();

        let start = Utc::now() - ChronoDuration::hours(1);
        let snapshots = [0, 30]
            .iter()
            .map(|offset| GpuUsageSnapshot {
                id: 0,
                job_id: job.id,
                timestamp: start + ChronoDuration::seconds(*offset),
                pod_name: "worker-0".to_string(),
                pod_namespace: "ml".to_string(),
                gpu_index: 0,
                gpu_uuid: "GPU-a".to_string(),
                gpu_memory_bytes: 1024,
                gpu_utilization: 0.5,
                node: "gpu-node-1".to_string(),
                mps_virtual_units: 10,
                mps_physical_gpu_index: 0,
            })
            .collect();
        usage.insert_snapshots(snapshots).await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_compute_missing_summaries_is_idempotent() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        let completed = finished_job_with_samples(&jobs, &usage, JobStatus::Completed).await;
        let preempted = finished_job_with_samples(&jobs, &usage, JobStatus::Preempted).await;
        finished_job_with_samples(&jobs, &usage, JobStatus::Running).await;
        let service = GpuUsageService::new(jobs, usage.clone(), &TelemetryConfig::default());
        let cancel = CancellationToken::new();

        assert_eq!(service.compute_missing_summaries(&cancel).await.unwrap(), 2);
        let first = service.get_summary(completed).await.unwrap().unwrap();
        assert_eq!(first.total_gpu_seconds, 60.0);
        assert!(service.get_summary(preempted).await.unwrap().is_some());

        assert_eq!(service.compute_missing_summaries(&cancel).await.unwrap(), 0);
        assert_eq!(usage.summary_count().await, 2);
        assert_eq!(service.get_summary(completed).await.unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn test_cleanup_snapshots() {
        let jobs = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryGpuUsageStore::new());
        finished_job_with_samples(&jobs, &usage, JobStatus::Completed).await;
        let service = GpuUsageService::new(jobs, usage.clone(), &TelemetryConfig::default());

        let removed = service
            .cleanup_snapshots(Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(usage.snapshot_count().await, 0);
    }
}
