//! GPU-time integration over irregularly sampled snapshots

use chrono::{DateTime, Utc};
use gpusched_core::JobId;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::model::{GpuUsageSnapshot, GpuUsageSummary};

/// Sampling interval assumed when the snapshots do not reveal one
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// Median of the positive gaps between consecutive buckets (unix seconds, sorted)
pub fn median_interval(buckets: &[i64]) -> Duration {
    if buckets.len() < 2 {
        return DEFAULT_SAMPLE_INTERVAL;
    }

    let mut gaps: Vec<u64> = buckets
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|gap| *gap > 0)
        .map(|gap| gap as u64)
        .collect();
    if gaps.is_empty() {
        return DEFAULT_SAMPLE_INTERVAL;
    }
    gaps.sort_unstable();

    let mid = gaps.len() / 2;
    if gaps.len() % 2 == 1 {
        Duration::from_secs(gaps[mid])
    } else {
        Duration::from_millis((gaps[mid - 1] + gaps[mid]) * 1000 / 2)
    }
}

/// Summarize a job's snapshots; `None` when there are none
///
/// Snapshots are bucketed by their timestamp truncated to the second. Each
/// bucket lasts until the next one (or the median interval for the last
/// bucket and non-positive gaps) and counts every distinct GPU key seen in it.
pub fn compute_summary(
    job_id: JobId,
    snapshots: &[GpuUsageSnapshot],
    computed_at: DateTime<Utc>,
) -> Option<GpuUsageSummary> {
    let first_snapshot = snapshots.first()?;

    let mut first = first_snapshot.timestamp;
    let mut last = first_snapshot.timestamp;
    let mut peak_memory = 0i64;
    let mut sum_utilization = 0f64;
    let mut sum_memory = 0i64;
    let mut slots: BTreeMap<i64, HashSet<String>> = BTreeMap::new();

    for snapshot in snapshots {
        first = first.min(snapshot.timestamp);
        last = last.max(snapshot.timestamp);
        peak_memory = peak_memory.max(snapshot.gpu_memory_bytes);
        sum_utilization += snapshot.gpu_utilization;
        sum_memory = sum_memory.saturating_add(snapshot.gpu_memory_bytes);

        slots
            .entry(snapshot.timestamp.timestamp())
            .or_default()
            .insert(snapshot.gpu_key());
    }

    let buckets: Vec<i64> = slots.keys().copied().collect();
    let interval = median_interval(&buckets);

    let total_gpu_seconds = buckets
        .iter()
        .enumerate()
        .map(|(i, bucket)| {
            let dt = match buckets.get(i + 1) {
                Some(next) if next > bucket => Duration::from_secs((next - bucket) as u64),
                _ => interval,
            };
            let gpus = slots.get(bucket).map_or(0, HashSet::len);
            dt.as_secs_f64() * gpus as f64
        })
        .sum();

    let sample_count = snapshots.len();
    Some(GpuUsageSummary {
        job_id,
        total_gpu_seconds,
        peak_memory_bytes: peak_memory,
        avg_utilization: sum_utilization / sample_count as f64,
        avg_memory_bytes: sum_memory / sample_count as i64,
        sample_count,
        first_sample_at: Some(first),
        last_sample_at: Some(last),
        computed_at,
    })
}
