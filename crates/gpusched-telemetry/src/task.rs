//! Background telemetry loop

use gpusched_core::{SchedError, TelemetryConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::service::GpuUsageService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryStage {
    Collect,
    Summarize,
    Cleanup,
}

impl fmt::Display for TelemetryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryStage::Collect => write!(f, "collect"),
            TelemetryStage::Summarize => write!(f, "summarize"),
            TelemetryStage::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Outcome of one telemetry stage, reported to the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Collected { snapshots: usize },
    Summarized { summaries: usize },
    CleanedUp { removed: usize },
    Failed { stage: TelemetryStage, error: String },
}

/// Timing of the telemetry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySchedule {
    pub collect_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,
}

impl From<&TelemetryConfig> for TelemetrySchedule {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            collect_interval: config.collect_interval(),
            cleanup_interval: config.cleanup_interval(),
            retention: config.retention(),
        }
    }
}

async fn report(events: &Option<mpsc::Sender<TelemetryEvent>>, event: TelemetryEvent) {
    if let TelemetryEvent::Failed { stage, error } = &event {
        warn!(stage = %stage, error = %error, "Telemetry stage failed");
    }
    if let Some(tx) = events {
        if tx.send(event).await.is_err() {
            debug!("Telemetry event receiver dropped");
        }
    }
}

/// Event for a stage result; `None` when the stage was cancelled
fn outcome<T>(
    stage: TelemetryStage,
    result: Result<T, SchedError>,
    ok: impl FnOnce(T) -> TelemetryEvent,
) -> Option<TelemetryEvent> {
    match result {
        Ok(value) => Some(ok(value)),
        Err(SchedError::Cancelled(_)) => None,
        Err(e) => Some(TelemetryEvent::Failed {
            stage,
            error: e.to_string(),
        }),
    }
}

async fn collect_and_summarize(
    service: &GpuUsageService,
    cancel: &CancellationToken,
    events: &Option<mpsc::Sender<TelemetryEvent>>,
) {
    let collected = service.collect_snapshots(cancel).await;
    if let Some(event) = outcome(TelemetryStage::Collect, collected, |snapshots| {
        TelemetryEvent::Collected { snapshots }
    }) {
        report(events, event).await;
    }

    let summarized = service.compute_missing_summaries(cancel).await;
    if let Some(event) = outcome(TelemetryStage::Summarize, summarized, |summaries| {
        TelemetryEvent::Summarized { summaries }
    }) {
        report(events, event).await;
    }
}

/// Collect and summarize now and then every `collect_interval`; clean up every `cleanup_interval`
///
/// Returns once `cancel` fires.
pub async fn run_telemetry(
    service: Arc<GpuUsageService>,
    schedule: TelemetrySchedule,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<TelemetryEvent>>,
) {
    info!(
        collect_interval_secs = schedule.collect_interval.as_secs(),
        cleanup_interval_secs = schedule.cleanup_interval.as_secs(),
        "Telemetry loop started"
    );

    collect_and_summarize(&service, &cancel, &events).await;

    let now = Instant::now();
    let mut collect = interval_at(now + schedule.collect_interval, schedule.collect_interval);
    collect.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cleanup = interval_at(now + schedule.cleanup_interval, schedule.cleanup_interval);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = collect.tick() => {
                collect_and_summarize(&service, &cancel, &events).await;
            }
            _ = cleanup.tick() => {
                let removed = service.cleanup_snapshots(schedule.retention).await;
                if let Some(event) = outcome(TelemetryStage::Cleanup, removed, |removed| {
                    TelemetryEvent::CleanedUp { removed }
                }) {
                    report(&events, event).await;
                }
            }
        }
    }

    info!("Telemetry loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGpuUsageStore;
    use gpusched_core::MemoryJobStore;

    fn unconfigured_service() -> Arc<GpuUsageService> {
        Arc::new(GpuUsageService::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryGpuUsageStore::new()),
            &TelemetryConfig::default(),
        ))
    }

    #[test]
    fn test_schedule_from_config() {
        let schedule = TelemetrySchedule::from(&TelemetryConfig::default());
        assert_eq!(schedule.collect_interval, Duration::from_secs(30));
        assert_eq!(schedule.cleanup_interval, Duration::from_secs(86_400));
        assert_eq!(schedule.retention, Duration::from_secs(2_592_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_immediately_then_on_schedule() {
        let schedule = TelemetrySchedule {
            collect_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(100),
            retention: Duration::from_secs(3600),
        };
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(run_telemetry(
            unconfigured_service(),
            schedule,
            cancel.clone(),
            Some(tx),
        ));

        // Immediate cycle: collection is unavailable, summarizing still runs
        match rx.recv().await.unwrap() {
            TelemetryEvent::Failed { stage, error } => {
                assert_eq!(stage, TelemetryStage::Collect);
                assert!(error.contains("not configured"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            TelemetryEvent::Summarized { summaries: 0 }
        );

        // Three collection cycles (30s, 60s, 90s) precede the first cleanup at 100s
        for _ in 0..3 {
            assert!(matches!(
                rx.recv().await.unwrap(),
                TelemetryEvent::Failed {
                    stage: TelemetryStage::Collect,
                    ..
                }
            ));
            assert!(matches!(
                rx.recv().await.unwrap(),
                TelemetryEvent::Summarized { .. }
            ));
        }
        assert_eq!(
            rx.recv().await.unwrap(),
            TelemetryEvent::CleanedUp { removed: 0 }
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_loop_stops_after_first_cycle() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, mut rx) = mpsc::channel(16);

        run_telemetry(
            unconfigured_service(),
            TelemetrySchedule::from(&TelemetryConfig::default()),
            cancel,
            Some(tx),
        )
        .await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            TelemetryEvent::Failed { .. }
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            TelemetryEvent::Summarized { summaries: 0 }
        );
        assert!(rx.recv().await.is_none());
    }
}
