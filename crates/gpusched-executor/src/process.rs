//! Process-based executor
//!
//! Runs a job's command as a local child process. Used for the plain `batch`
//! job type on single-node installs and in development.

use async_trait::async_trait;
use gpusched_core::{
    Job, JobId, JobStatus, JobType, MpsConfig, SchedError, SchedResult, MPS_UNITS_PER_GPU,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::traits::Executor;

/// Process executor configuration
#[derive(Debug, Clone)]
pub struct ProcessExecutorConfig {
    /// Working directory for launched jobs
    pub working_dir: Option<PathBuf>,
    /// Environment added to every job
    pub extra_env: BTreeMap<String, String>,
    /// Job types this executor claims
    pub job_types: Vec<JobType>,
}

impl Default for ProcessExecutorConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            extra_env: BTreeMap::new(),
            job_types: vec![JobType::batch()],
        }
    }
}

struct ManagedProcess {
    child: Child,
    logs: Arc<Mutex<String>>,
}

/// Executor that runs jobs as local processes
pub struct ProcessExecutor {
    config: ProcessExecutorConfig,
    processes: Mutex<HashMap<JobId, ManagedProcess>>,
}

impl ProcessExecutor {
    /// Create a new process executor
    pub fn new(config: ProcessExecutorConfig) -> Self {
        Self {
            config,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Build the command to run `command_line` on behalf of `job`
    fn build_command(&self, job: &Job, command_line: &[String]) -> SchedResult<Command> {
        let (program, args) = command_line
            .split_first()
            .ok_or_else(|| SchedError::Execution(format!("job {} has no command", job.id)))?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in self.config.extra_env.iter().chain(job.env.iter()) {
            cmd.env(key, value);
        }

        if job.required_gpu > 0 {
            let gpu_ids: String = (0..job.required_gpu)
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            cmd.env("CUDA_VISIBLE_DEVICES", &gpu_ids);
        }

        // Fractional jobs get an MPS thread share proportional to their units
        if job.mps_units > 0 {
            let percentage = (job.mps_units.saturating_mul(100) / MPS_UNITS_PER_GPU).min(100);
            let mps = MpsConfig {
                thread_percentage: percentage as i32,
                memory_limit_mb: 0,
            };
            mps.validate()?;
            for (key, value) in mps.to_env_vars() {
                cmd.env(key, value);
            }
        }

        cmd.env("GPUSCHED_JOB_ID", job.id.to_string());
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        Ok(cmd)
    }

    /// Spawn `command_line` and track it under the job's id
    pub(crate) async fn launch(&self, job: &Job, command_line: &[String]) -> SchedResult<()> {
        let mut processes = self.processes.lock().await;
        if processes.contains_key(&job.id) {
            return Err(SchedError::Conflict(format!(
                "job {} is already launched",
                job.id
            )));
        }

        let mut cmd = self.build_command(job, command_line)?;

        info!(
            job_id = %job.id,
            program = %command_line[0],
            "Starting job process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!(job_id = %job.id, error = %e, "Failed to spawn job process");
            SchedError::Execution(format!("Failed to spawn job {}: {}", job.id, e))
        })?;

        let logs = Arc::new(Mutex::new(String::new()));
        if let Some(stdout) = child.stdout.take() {
            capture_output(stdout, logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            capture_output(stderr, logs.clone());
        }

        debug!(job_id = %job.id, pid = ?child.id(), "Job process spawned");
        processes.insert(job.id, ManagedProcess { child, logs });
        Ok(())
    }

    /// Number of tracked processes
    pub async fn tracked(&self) -> usize {
        self.processes.lock().await.len()
    }
}

fn capture_output<R>(reader: R, logs: Arc<Mutex<String>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut buf = logs.lock().await;
            buf.push_str(&line);
            buf.push('\n');
        }
    });
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, job: &Job) -> SchedResult<()> {
        self.launch(job, &job.command).await
    }

    async fn cancel(&self, job_id: JobId) -> SchedResult<()> {
        let mut process = self
            .processes
            .lock()
            .await
            .remove(&job_id)
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))?;

        info!(job_id = %job_id, pid = ?process.child.id(), "Stopping job process");

        process
            .child
            .kill()
            .await
            .map_err(|e| SchedError::Execution(format!("Failed to kill job {}: {}", job_id, e)))
    }

    async fn get_status(&self, job_id: JobId) -> SchedResult<JobStatus> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(&job_id)
            .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))?;

        match process.child.try_wait()? {
            None => Ok(JobStatus::Running),
            Some(status) if status.success() => Ok(JobStatus::Completed),
            Some(_) => Ok(JobStatus::Failed),
        }
    }

    async fn get_logs(&self, job_id: JobId) -> SchedResult<String> {
        let logs = {
            let processes = self.processes.lock().await;
            processes
                .get(&job_id)
                .map(|p| p.logs.clone())
                .ok_or_else(|| SchedError::JobNotFound(job_id.to_string()))?
        };
        let buf = logs.lock().await;
        Ok(buf.clone())
    }

    async fn release(&self, job_id: JobId) -> SchedResult<()> {
        if self.processes.lock().await.remove(&job_id).is_some() {
            debug!(job_id = %job_id, "Finished job process released");
        }
        Ok(())
    }

    fn supports_type(&self, job_type: &JobType) -> bool {
        self.config.job_types.contains(job_type)
    }

    fn name(&self) -> &'static str {
        "process"
    }
}
