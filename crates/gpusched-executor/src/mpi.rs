//! MPI-style multi-replica executor

use async_trait::async_trait;
use gpusched_core::{Job, JobId, JobStatus, JobType, SchedError, SchedResult};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::process::{ProcessExecutor, ProcessExecutorConfig};
use crate::traits::Executor;

/// One line of an MPI hostfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostfileEntry {
    pub hostname: String,
    pub slots: u32,
}

impl fmt::Display for HostfileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} slots={}", self.hostname, self.slots)
    }
}

/// Render hostfile entries, one per line
pub fn generate_hostfile_content(entries: &[HostfileEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// MPI executor configuration
#[derive(Debug, Clone)]
pub struct MpiExecutorConfig {
    /// Launcher binary
    pub mpirun_path: PathBuf,
    /// Directory hostfiles are written to
    pub hostfile_dir: PathBuf,
    /// MPI slots per replica
    pub slots_per_replica: u32,
}

impl Default for MpiExecutorConfig {
    fn default() -> Self {
        Self {
            mpirun_path: PathBuf::from("mpirun"),
            hostfile_dir: std::env::temp_dir(),
            slots_per_replica: 1,
        }
    }
}

/// Executor for multi-replica MPI jobs
///
/// Replica `i` of a job is addressed as `<job name>-worker-<i>`.
pub struct MpiExecutor {
    config: MpiExecutorConfig,
    launcher: ProcessExecutor,
}

impl MpiExecutor {
    pub fn new(config: MpiExecutorConfig) -> Self {
        let launcher = ProcessExecutor::new(ProcessExecutorConfig {
            job_types: vec![JobType::mpi()],
            ..Default::default()
        });
        Self { config, launcher }
    }

    /// Hostfile entries for every replica of a job
    pub fn hostfile_entries(&self, job: &Job) -> Vec<HostfileEntry> {
        (0..job.replicas)
            .map(|i| HostfileEntry {
                hostname: format!("{}-worker-{}", job.name, i),
                slots: self.config.slots_per_replica,
            })
            .collect()
    }

    fn hostfile_path(&self, job_id: JobId) -> PathBuf {
        self.config.hostfile_dir.join(format!("{}.hostfile", job_id))
    }

    /// Write the job's hostfile and return its path
    pub async fn write_hostfile(&self, job: &Job) -> SchedResult<PathBuf> {
        let path = self.hostfile_path(job.id);
        let content = generate_hostfile_content(&self.hostfile_entries(job));
        tokio::fs::write(&path, content).await?;
        debug!(job_id = %job.id, path = %path.display(), "Hostfile written");
        Ok(path)
    }

    async fn remove_hostfile(&self, job_id: JobId) {
        let path = self.hostfile_path(job_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to remove hostfile"),
        }
    }

    fn launch_command(&self, job: &Job, hostfile: &std::path::Path) -> Vec<String> {
        let processes = job.replicas.saturating_mul(self.config.slots_per_replica);
        let mut command = vec![
            self.config.mpirun_path.display().to_string(),
            "-np".to_string(),
            processes.to_string(),
            "--hostfile".to_string(),
            hostfile.display().to_string(),
        ];
        command.extend(job.command.iter().cloned());
        command
    }
}

#[async_trait]
impl Executor for MpiExecutor {
    async fn execute(&self, job: &Job) -> SchedResult<()> {
        if job.replicas < 2 {
            return Err(SchedError::Execution(format!(
                "MPI jobs require at least 2 replicas, job {} has {}",
                job.id, job.replicas
            )));
        }
        if job.command.is_empty() {
            return Err(SchedError::Execution(format!("job {} has no command", job.id)));
        }

        let hostfile = self.write_hostfile(job).await?;
        let command = self.launch_command(job, &hostfile);
        self.launcher.launch(job, &command).await
    }

    async fn cancel(&self, job_id: JobId) -> SchedResult<()> {
        self.launcher.cancel(job_id).await?;
        self.remove_hostfile(job_id).await;
        Ok(())
    }

    async fn get_status(&self, job_id: JobId) -> SchedResult<JobStatus> {
        self.launcher.get_status(job_id).await
    }

    async fn get_logs(&self, job_id: JobId) -> SchedResult<String> {
        self.launcher.get_logs(job_id).await
    }

    async fn release(&self, job_id: JobId) -> SchedResult<()> {
        self.launcher.release(job_id).await?;
        self.remove_hostfile(job_id).await;
        Ok(())
    }

    fn supports_type(&self, job_type: &JobType) -> bool {
        job_type.as_str() == JobType::MPI
    }

    fn name(&self) -> &'static str {
        "mpi"
    }
}
