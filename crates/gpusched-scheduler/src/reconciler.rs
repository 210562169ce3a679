//! Brings RUNNING jobs in line with what their executors report

use gpusched_core::{Job, JobId, JobStatus, JobStore, SchedResult};
use gpusched_executor::ExecutorRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A job moved out of RUNNING by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedJob {
    pub job_id: JobId,
    pub status: JobStatus,
}

pub struct Reconciler {
    registry: Arc<ExecutorRegistry>,
    jobs: Arc<dyn JobStore>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        jobs: Arc<dyn JobStore>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            jobs,
            interval,
        }
    }

    /// Record the final status of every RUNNING job whose executor reports it finished
    ///
    /// Jobs no executor tracks are left alone. A job that left RUNNING some
    /// other way (preempted, cancelled) keeps that status and is not reported.
    pub async fn reconcile_once(&self) -> SchedResult<Vec<FinishedJob>> {
        let running = self.jobs.list_by_status(&[JobStatus::Running]).await?;

        let mut finished = Vec::new();
        for job in &running {
            let status = match self.registry.get_status(job).await {
                Ok(status) => status,
                Err(e) if e.is_not_found() => {
                    debug!(job_id = %job.id, error = %e, "Running job not tracked by an executor");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to read job status");
                    continue;
                }
            };
            if !status.is_terminal() {
                continue;
            }

            if let Some(done) = self.finish(job, status).await {
                finished.push(done);
            }
        }

        Ok(finished)
    }

    async fn finish(&self, job: &Job, status: JobStatus) -> Option<FinishedJob> {
        let reason = (status == JobStatus::Failed).then_some("executor reported failure");
        let moved = match self
            .jobs
            .update_status_if(job.id, JobStatus::Running, status, reason)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to record job completion");
                return None;
            }
        };

        if let Err(e) = self.registry.release(job).await {
            warn!(job_id = %job.id, error = %e, "Failed to release finished job");
        }

        if !moved {
            return None;
        }
        info!(job_id = %job.id, status = %status, "Job finished");
        Some(FinishedJob {
            job_id: job.id,
            status,
        })
    }

    /// Reconcile every interval until `cancel` fires, reporting finished jobs on `events`
    pub async fn run(&self, cancel: CancellationToken, events: Option<mpsc::Sender<FinishedJob>>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "Reconciler started"
        );

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let finished = match self.reconcile_once().await {
                        Ok(finished) => finished,
                        Err(e) => {
                            warn!(error = %e, "Reconcile pass failed");
                            continue;
                        }
                    };
                    let Some(tx) = &events else {
                        continue;
                    };
                    for done in finished {
                        if tx.send(done).await.is_err() {
                            debug!("Reconcile event receiver dropped");
                            break;
                        }
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}
