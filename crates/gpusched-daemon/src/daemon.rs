//! Component wiring and supervision
//!
//! Job intake through [`Daemon::submit`] belongs to an embedding API layer;
//! the binary itself only runs the loops.

use anyhow::{Context, Result};
use gpusched_core::{
    DaemonConfig, Job, JobId, JobStore, JobType, MemoryJobStore, MemoryQuotaStore, Monitor,
    ResourceRequirement, SchedError, SnapshotMonitor,
};
use gpusched_executor::{
    ExecutorRegistry, MpiExecutor, MpiExecutorConfig, ProcessExecutor, ProcessExecutorConfig,
};
use gpusched_priority::{
    CumulativeGpuStrategy, PreemptionConfig, PreemptionService, PriorityManager,
    PriorityWeightStrategy,
};
use gpusched_scheduler::{DispatchEvent, FinishedJob, QuotaTracker, Reconciler, Scheduler};
use gpusched_telemetry::{
    run_telemetry, GpuUsageService, KubeClusterClient, MemoryGpuUsageStore, PrometheusClient,
    TelemetryEvent, TelemetrySchedule,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_BUFFER: usize = 64;

/// Every long-lived component of the daemon
pub struct Daemon {
    config: DaemonConfig,
    jobs: Arc<MemoryJobStore>,
    quotas: Arc<QuotaTracker>,
    monitor: Arc<SnapshotMonitor>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    preemption: Arc<PreemptionService>,
    telemetry: Arc<GpuUsageService>,
}

impl Daemon {
    /// Build and connect all components from `config`
    pub async fn build(config: DaemonConfig) -> Result<Self> {
        let jobs = Arc::new(MemoryJobStore::new());
        let quotas = Arc::new(QuotaTracker::new(Arc::new(MemoryQuotaStore::new())));
        let monitor = Arc::new(SnapshotMonitor::new());

        let registry = Arc::new(ExecutorRegistry::new());
        registry
            .register(
                JobType::batch(),
                Arc::new(ProcessExecutor::new(ProcessExecutorConfig::default())),
            )
            .await;
        registry
            .register(
                JobType::mpi(),
                Arc::new(MpiExecutor::new(MpiExecutorConfig::default())),
            )
            .await;

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            jobs.clone(),
            config.scheduler.reconcile_interval(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            registry,
            jobs.clone(),
            config.scheduler.tick_interval(),
        ));

        let preemption_config = PreemptionConfig::from(&config.preemption);
        let manager = Arc::new(PriorityManager::new());
        manager
            .register_strategy(Arc::new(CumulativeGpuStrategy::new(
                jobs.clone(),
                preemption_config.clone(),
            )))
            .await;
        manager
            .register_strategy(Arc::new(PriorityWeightStrategy::new(
                jobs.clone(),
                preemption_config,
            )))
            .await;
        manager
            .set_active_strategy(&config.preemption.active_strategy)
            .await
            .context("Invalid [preemption].active_strategy")?;
        let preemption = Arc::new(PreemptionService::new(manager, jobs.clone()));

        let telemetry = Arc::new(Self::build_telemetry(&config, jobs.clone()).await?);

        Ok(Self {
            config,
            jobs,
            quotas,
            monitor,
            scheduler,
            reconciler,
            preemption,
            telemetry,
        })
    }

    async fn build_telemetry(
        config: &DaemonConfig,
        jobs: Arc<MemoryJobStore>,
    ) -> Result<GpuUsageService> {
        let mut service =
            GpuUsageService::new(jobs, Arc::new(MemoryGpuUsageStore::new()), &config.telemetry);

        match &config.telemetry.prometheus_url {
            Some(url) => {
                let client = PrometheusClient::new(
                    url.clone(),
                    Duration::from_secs(config.telemetry.query_timeout_secs),
                )
                .context("Failed to create Prometheus client")?;
                info!(url = %url, "Prometheus metrics backend configured");
                service = service.with_metrics(Arc::new(client));
            }
            None => warn!("No Prometheus URL configured, GPU usage collection disabled"),
        }

        if config.cluster.enabled {
            match KubeClusterClient::connect(config.cluster.kubeconfig.clone()).await {
                Ok(client) => service = service.with_cluster(Arc::new(client)),
                Err(e) => {
                    warn!(error = %e, "Cluster client unavailable, GPU usage collection disabled")
                }
            }
        }

        Ok(service)
    }

    /// Admit a job: reserve its MPS quota, store it, and queue it
    ///
    /// When the cluster reports a shortage, lower-priority work is preempted first.
    pub async fn submit(&self, job: Job) -> Result<()> {
        if job.mps_units > 0 {
            self.quotas
                .allocate_for_job(&job)
                .await
                .with_context(|| format!("Job {} rejected", job.id))?;
        }
        if let Err(e) = self.jobs.create(job.clone()).await {
            self.release_quota(&job).await;
            return Err(e).context("Failed to store job");
        }

        let req = ResourceRequirement::for_job(&job);
        match self.preemption.ensure_capacity(self.monitor.as_ref(), &req).await {
            Ok(victims) => {
                for victim in victims {
                    self.release_quota_of(victim).await;
                }
            }
            Err(SchedError::Unavailable(reason)) => {
                debug!(reason = %reason, "No resource metrics, skipping shortage check");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Preemption failed"),
        }

        self.scheduler.enqueue_job(job).await;
        Ok(())
    }

    async fn release_quota(&self, job: &Job) {
        if let Err(e) = self.quotas.release_for_job(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to release MPS quota");
        }
    }

    async fn release_quota_of(&self, job_id: JobId) {
        match self.jobs.get(job_id).await {
            Ok(job) => self.release_quota(&job).await,
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to load job"),
        }
    }

    async fn on_dispatch(&self, event: DispatchEvent) {
        match event {
            DispatchEvent::Started { job_id } => debug!(job_id = %job_id, "Job started"),
            DispatchEvent::Failed { job_id, error } => {
                warn!(job_id = %job_id, error = %error, "Job failed to start");
                self.release_quota_of(job_id).await;
            }
            DispatchEvent::Unsupported { job_id, job_type } => {
                warn!(job_id = %job_id, job_type = %job_type, "Job waiting for an executor");
            }
        }
    }

    async fn on_finished(&self, finished: FinishedJob) {
        debug!(job_id = %finished.job_id, status = %finished.status, "Releasing finished job");
        self.release_quota_of(finished.job_id).await;
    }

    fn on_telemetry(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::Collected { snapshots } => debug!(snapshots, "GPU usage collected"),
            TelemetryEvent::Summarized { summaries } => debug!(summaries, "GPU usage summarized"),
            TelemetryEvent::CleanedUp { removed } => debug!(removed, "GPU usage cleaned up"),
            // Already logged by the telemetry loop
            TelemetryEvent::Failed { .. } => {}
        }
    }

    /// Run the dispatch, reconcile and telemetry loops until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let daemon = Arc::new(self);
        daemon.monitor.start().await?;

        let (dispatch_tx, mut dispatch_rx) = mpsc::channel(EVENT_BUFFER);
        let dispatcher = {
            let scheduler = daemon.scheduler.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move { scheduler.run(cancel, Some(dispatch_tx)).await })
        };

        let (reconcile_tx, mut reconcile_rx) = mpsc::channel(EVENT_BUFFER);
        let reconciler = {
            let reconciler = daemon.reconciler.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move { reconciler.run(cancel, Some(reconcile_tx)).await })
        };

        let (telemetry_tx, mut telemetry_rx) = mpsc::channel(EVENT_BUFFER);
        let telemetry = tokio::spawn(run_telemetry(
            daemon.telemetry.clone(),
            TelemetrySchedule::from(&daemon.config.telemetry),
            cancel.child_token(),
            Some(telemetry_tx),
        ));

        info!(
            strategy = %daemon.config.preemption.active_strategy,
            "gpusched daemon running"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = dispatch_rx.recv() => daemon.on_dispatch(event).await,
                Some(finished) = reconcile_rx.recv() => daemon.on_finished(finished).await,
                Some(event) = telemetry_rx.recv() => daemon.on_telemetry(event),
                else => break,
            }
        }

        cancel.cancel();
        dispatcher
            .await
            .context("Dispatch loop panicked")?
            .context("Dispatch loop failed")?;
        reconciler.await.context("Reconcile loop panicked")?;
        telemetry.await.context("Telemetry loop panicked")?;
        daemon.monitor.stop().await?;

        let state = daemon.scheduler.state().await;
        info!(
            dispatched = state.dispatched,
            failed = state.failed,
            pending = state.queue_depth,
            "gpusched daemon stopped"
        );
        Ok(())
    }

    pub fn jobs(&self) -> &Arc<MemoryJobStore> {
        &self.jobs
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn quotas(&self) -> &Arc<QuotaTracker> {
        &self.quotas
    }

    pub fn monitor(&self) -> &Arc<SnapshotMonitor> {
        &self.monitor
    }
}
