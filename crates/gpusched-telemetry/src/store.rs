//! GPU usage persistence contract and in-memory implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gpusched_core::{JobId, SchedResult};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{GpuUsageSnapshot, GpuUsageSummary, SnapshotPage};

/// Page size used when the caller asks for a non-positive limit
pub const DEFAULT_PAGE_LIMIT: usize = 200;

#[async_trait]
pub trait GpuUsageStore: Send + Sync {
    /// Persist a batch of snapshots in one write
    async fn insert_snapshots(&self, batch: Vec<GpuUsageSnapshot>) -> SchedResult<()>;

    /// Page of a job's snapshots ordered by timestamp
    ///
    /// `limit <= 0` means [`DEFAULT_PAGE_LIMIT`]; a negative offset means 0.
    async fn list_snapshots_by_job(
        &self,
        job_id: JobId,
        limit: i64,
        offset: i64,
    ) -> SchedResult<SnapshotPage>;

    /// Every snapshot of a job ordered by timestamp
    async fn list_all_snapshots_by_job(&self, job_id: JobId) -> SchedResult<Vec<GpuUsageSnapshot>>;

    async fn get_summary(&self, job_id: JobId) -> SchedResult<Option<GpuUsageSummary>>;

    async fn upsert_summary(&self, summary: GpuUsageSummary) -> SchedResult<()>;

    /// Drop snapshots older than `cutoff`, returning how many went
    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> SchedResult<usize>;
}

#[derive(Default)]
struct UsageTables {
    snapshots: Vec<GpuUsageSnapshot>,
    summaries: HashMap<JobId, GpuUsageSummary>,
    next_id: u64,
}

#[derive(Default)]
pub struct MemoryGpuUsageStore {
    inner: RwLock<UsageTables>,
}

impl MemoryGpuUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot_count(&self) -> usize {
        self.inner.read().await.snapshots.len()
    }

    pub async fn summary_count(&self) -> usize {
        self.inner.read().await.summaries.len()
    }
}

fn sorted_for_job(snapshots: &[GpuUsageSnapshot], job_id: JobId) -> Vec<GpuUsageSnapshot> {
    let mut rows: Vec<GpuUsageSnapshot> = snapshots
        .iter()
        .filter(|s| s.job_id == job_id)
        .cloned()
        .collect();
    rows.sort_by_key(|s| (s.timestamp, s.id));
    rows
}

#[async_trait]
impl GpuUsageStore for MemoryGpuUsageStore {
    async fn insert_snapshots(&self, batch: Vec<GpuUsageSnapshot>) -> SchedResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.inner.write().await;
        let count = batch.len();
        for mut snapshot in batch {
            tables.next_id += 1;
            snapshot.id = tables.next_id;
            tables.snapshots.push(snapshot);
        }
        debug!(count, "Snapshots inserted");
        Ok(())
    }

    async fn list_snapshots_by_job(
        &self,
        job_id: JobId,
        limit: i64,
        offset: i64,
    ) -> SchedResult<SnapshotPage> {
        let limit = usize::try_from(limit)
            .ok()
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = usize::try_from(offset).unwrap_or(0);

        let rows = sorted_for_job(&self.inner.read().await.snapshots, job_id);
        let total = rows.len();
        let snapshots = rows.into_iter().skip(offset).take(limit).collect();
        Ok(SnapshotPage { snapshots, total })
    }

    async fn list_all_snapshots_by_job(&self, job_id: JobId) -> SchedResult<Vec<GpuUsageSnapshot>> {
        Ok(sorted_for_job(&self.inner.read().await.snapshots, job_id))
    }

    async fn get_summary(&self, job_id: JobId) -> SchedResult<Option<GpuUsageSummary>> {
        Ok(self.inner.read().await.summaries.get(&job_id).cloned())
    }

    async fn upsert_summary(&self, summary: GpuUsageSummary) -> SchedResult<()> {
        self.inner
            .write()
            .await
            .summaries
            .insert(summary.job_id, summary);
        Ok(())
    }

    async fn delete_snapshots_before(&self, cutoff: DateTime<Utc>) -> SchedResult<usize> {
        let mut tables = self.inner.write().await;
        let before = tables.snapshots.len();
        tables.snapshots.retain(|s| s.timestamp >= cutoff);
        Ok(before - tables.snapshots.len())
    }
}
