// Job manager.
//
// A job is one load-test run executed by a worker subprocess. The manager
// enforces a concurrency ceiling, tracks lifecycle state, and supervises the
// worker from spawn to exit. Terminal states are never re-entered.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::config::TestConfig;
use crate::error::LoadTestError;
use crate::process::{SupervisedChild, WaitOutcome, WorkerCommand};

/// Concurrency ceiling for non-terminal jobs.
pub const MAX_CONCURRENT_JOBS: usize = 5;
/// Terminal jobs older than this are eligible for cleanup.
pub const JOB_RETENTION: Duration = Duration::from_secs(3600);
/// SIGTERM-to-SIGKILL escalation window for stop requests.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Extra time a worker gets beyond its configured runtime before the
/// supervisor declares it hung.
const RUN_GRACE: Duration = Duration::from_secs(60);
/// Characters of worker stderr quoted in failure messages.
const STDERR_QUOTE_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker was stopped; true when it exited within the SIGTERM grace.
    Stopped { graceful: bool },
    /// The job had already reached a terminal state.
    AlreadyTerminal(JobStatus),
}

type StopRequest = oneshot::Sender<bool>;

struct Job {
    config: TestConfig,
    status: JobStatus,
    error: Option<String>,
    created_at: u64,
    started_at: Option<u64>,
    ended_at: Option<u64>,
    stop_tx: mpsc::Sender<StopRequest>,
}

/// Snapshot of one job, shaped for JSON output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub status: JobStatus,
    pub config: TestConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
}

pub struct JobManager {
    jobs: Arc<DashMap<String, Job>>,
    create_lock: Mutex<()>,
    max_concurrent: usize,
    retention: Duration,
    command: WorkerCommand,
    run_grace: Duration,
}

impl JobManager {
    pub fn new() -> Self {
        Self::with_command(WorkerCommand::current_exe())
    }

    /// Build a manager that launches workers with the given command.
    pub fn with_command(command: WorkerCommand) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            create_lock: Mutex::new(()),
            max_concurrent: MAX_CONCURRENT_JOBS,
            retention: JOB_RETENTION,
            command,
            run_grace: RUN_GRACE,
        }
    }

    /// Shrink the runtime grace window. Test hook.
    pub fn with_run_grace(mut self, grace: Duration) -> Self {
        self.run_grace = grace;
        self
    }

    /// Validate the config, check capacity, and launch a worker.
    pub async fn create_job(&self, config: TestConfig) -> Result<JobInfo, LoadTestError> {
        if let Err(problems) = config.validate() {
            return Err(LoadTestError::ConfigError(problems.join("; ")));
        }

        // The lock makes count-then-insert atomic so concurrent creates
        // cannot overshoot the ceiling.
        let _guard = self.create_lock.lock().await;
        let active = self.jobs.iter().filter(|j| !j.status.is_terminal()).count();
        if active >= self.max_concurrent {
            return Err(LoadTestError::CapacityExceeded(self.max_concurrent));
        }

        let id = new_job_id();
        let (stop_tx, stop_rx) = mpsc::channel::<StopRequest>(1);
        let job = Job {
            config: config.clone(),
            status: JobStatus::Pending,
            error: None,
            created_at: now_millis(),
            started_at: None,
            ended_at: None,
            stop_tx,
        };
        let info = snapshot(&id, &job);
        self.jobs.insert(id.clone(), job);

        let jobs = Arc::clone(&self.jobs);
        let command = self.command.clone();
        let deadline = Duration::from_secs(config.runtime_seconds) + self.run_grace;
        tokio::spawn(supervise(jobs, id, config, command, deadline, stop_rx));

        Ok(info)
    }

    pub fn get_job(&self, id: &str) -> Result<JobInfo, LoadTestError> {
        self.jobs
            .get(id)
            .map(|job| snapshot(id, &job))
            .ok_or_else(|| LoadTestError::JobNotFound(id.to_string()))
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|entry| snapshot(entry.key(), &entry))
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        infos
    }

    /// Request a graceful stop and wait for the worker to go down.
    pub async fn stop_job(&self, id: &str) -> Result<StopOutcome, LoadTestError> {
        let stop_tx = {
            let job = self
                .jobs
                .get(id)
                .ok_or_else(|| LoadTestError::JobNotFound(id.to_string()))?;
            if job.status.is_terminal() {
                return Ok(StopOutcome::AlreadyTerminal(job.status));
            }
            job.stop_tx.clone()
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if stop_tx.send(ack_tx).await.is_err() {
            // Supervisor already finished between the status check and here.
            let job = self
                .jobs
                .get(id)
                .ok_or_else(|| LoadTestError::JobNotFound(id.to_string()))?;
            return Ok(StopOutcome::AlreadyTerminal(job.status));
        }

        match tokio::time::timeout(STOP_GRACE + Duration::from_secs(5), ack_rx).await {
            Ok(Ok(graceful)) => Ok(StopOutcome::Stopped { graceful }),
            _ => {
                let status = self.get_job(id)?.status;
                if status.is_terminal() {
                    Ok(StopOutcome::AlreadyTerminal(status))
                } else {
                    Err(LoadTestError::WorkerFailed(
                        "stop request was not acknowledged".to_string(),
                    ))
                }
            }
        }
    }

    /// Drop terminal jobs whose end time is older than the retention window.
    /// Returns the number of jobs removed. Shares the creation lock so a
    /// sweep never interleaves with a capacity check.
    pub async fn cleanup_expired(&self) -> usize {
        let _guard = self.create_lock.lock().await;
        let cutoff = now_millis().saturating_sub(self.retention.as_millis() as u64);
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|entry| {
                entry.status.is_terminal()
                    && entry.ended_at.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in &expired {
            self.jobs.remove(id);
        }
        expired.len()
    }
}

impl Default for JobManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn supervise(
    jobs: Arc<DashMap<String, Job>>,
    id: String,
    config: TestConfig,
    command: WorkerCommand,
    deadline: Duration,
    mut stop_rx: mpsc::Receiver<StopRequest>,
) {
    let env = config.to_env();
    let mut child = match SupervisedChild::spawn(&command, &env) {
        Ok(child) => child,
        Err(e) => {
            finish(&jobs, &id, JobStatus::Failed, Some(e.to_string()));
            return;
        }
    };

    if let Some(mut job) = jobs.get_mut(&id) {
        job.status = JobStatus::Running;
        job.started_at = Some(now_millis());
    }

    enum Wakeup {
        Exited(WaitOutcome),
        Stop(Option<StopRequest>),
    }

    let wakeup = tokio::select! {
        outcome = child.wait_with_deadline(deadline) => Wakeup::Exited(outcome),
        request = stop_rx.recv() => Wakeup::Stop(request),
    };

    let outcome = match wakeup {
        Wakeup::Stop(Some(ack)) => {
            let graceful = child.terminate(STOP_GRACE).await;
            finish(&jobs, &id, JobStatus::Stopped, None);
            let _ = ack.send(graceful);
            return;
        }
        // All stop senders gone (job table dropped); just see the run out.
        Wakeup::Stop(None) => child.wait_with_deadline(deadline).await,
        Wakeup::Exited(outcome) => outcome,
    };

    match outcome {
        WaitOutcome::Exited { code: Some(0) } => {
            finish(&jobs, &id, JobStatus::Completed, None);
        }
        WaitOutcome::Exited { code } => {
            let stderr = child.stderr_tail();
            let tail = stderr_quote(&stderr);
            let message = match code {
                Some(code) => format!("Exit code {}: {}", code, tail),
                None => format!("Killed by signal: {}", tail),
            };
            finish(&jobs, &id, JobStatus::Failed, Some(message));
        }
        WaitOutcome::DeadlineExceeded => {
            child.terminate(STOP_GRACE).await;
            finish(
                &jobs,
                &id,
                JobStatus::Failed,
                Some(format!("Worker did not exit within {:?}", deadline)),
            );
        }
    }
}

fn finish(jobs: &DashMap<String, Job>, id: &str, status: JobStatus, error: Option<String>) {
    if let Some(mut job) = jobs.get_mut(id) {
        if job.status.is_terminal() {
            return;
        }
        job.status = status;
        job.error = error;
        job.ended_at = Some(now_millis());
    }
}

fn snapshot(id: &str, job: &Job) -> JobInfo {
    JobInfo {
        id: id.to_string(),
        status: job.status,
        config: job.config.clone(),
        error: job.error.clone(),
        created_at: job.created_at,
        started_at: job.started_at,
        ended_at: job.ended_at,
    }
}

/// The last characters of the captured stderr. The end of the stream is
/// where the worker reports what actually killed it.
fn stderr_quote(stderr: &str) -> &str {
    let start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_QUOTE_LIMIT - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &stderr[start..]
}

fn new_job_id() -> String {
    let mut id = format!("{:x}", md5::compute(rand::random::<[u8; 16]>()));
    id.truncate(8);
    id
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
