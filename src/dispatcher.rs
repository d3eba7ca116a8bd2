//! Job dispatcher: validates submissions, registers jobs and runs them in
//! the background under a bounded number of concurrent executions.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CancelError, SpawnError, SubmitError};
use crate::job::{now_ms, Job, JobStatus};
use crate::registry::TaskRegistry;
use crate::sandbox::{self, Execution, ExitOutcome, ResourceUsage, SandboxProfile};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub max_concurrent_jobs: usize,
    pub profile: SandboxProfile,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 60,
            max_timeout_seconds: 3600,
            max_concurrent_jobs: 16,
            profile: SandboxProfile::default(),
        }
    }
}

/// What the caller gets back from an accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub task_id: String,
    pub timeout_seconds: u64,
}

pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    profile: Arc<SandboxProfile>,
    permits: Arc<Semaphore>,
    cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
    default_timeout_seconds: u64,
    max_timeout_seconds: u64,
}

impl Dispatcher {
    pub fn new(registry: Arc<TaskRegistry>, config: DispatcherConfig) -> Self {
        Self {
            registry,
            profile: Arc::new(config.profile),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            default_timeout_seconds: config.default_timeout_seconds,
            max_timeout_seconds: config.max_timeout_seconds,
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Absent or non-positive requests get the default; larger ones are
    /// clamped to the maximum.
    pub fn effective_timeout(&self, requested: Option<i64>) -> u64 {
        match requested {
            Some(t) if t > 0 => (t as u64).min(self.max_timeout_seconds),
            _ => self.default_timeout_seconds,
        }
    }

    /// Register `argv` as a new job and start it in the background.
    ///
    /// Returns as soon as the job is registered. Must be called from within
    /// a Tokio runtime.
    pub fn submit(&self, argv: Vec<String>, timeout: Option<i64>) -> Result<Submission, SubmitError> {
        let binary = argv
            .first()
            .filter(|b| !b.is_empty())
            .ok_or(SubmitError::EmptyCommand)?;
        let program = resolve_binary(binary, self.profile.chroot_dir.as_deref())?;

        let timeout_seconds = self.effective_timeout(timeout);
        let mut job = Job::new(argv.clone(), timeout_seconds);
        job.log_event(
            "task_submitted",
            json!({ "timeout": timeout_seconds, "argc": argv.len() }),
        );
        let task_id = job.task_id.clone();

        let token = CancellationToken::new();
        self.cancels.lock().insert(task_id.clone(), token.clone());
        if let Err(e) = self.registry.create(job) {
            self.cancels.lock().remove(&task_id);
            return Err(e.into());
        }
        info!(task_id = %task_id, command = ?argv, timeout_seconds, "Task submitted");

        let worker = Worker {
            registry: Arc::clone(&self.registry),
            profile: Arc::clone(&self.profile),
            task_id: task_id.clone(),
            program,
            argv,
            timeout_seconds,
            token,
        };
        let permits = Arc::clone(&self.permits);
        let cancels = Arc::clone(&self.cancels);
        tokio::spawn(async move {
            let task_id = worker.task_id.clone();
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    let registry = Arc::clone(&worker.registry);
                    if let Err(e) = tokio::task::spawn_blocking(move || worker.execute()).await {
                        error!(task_id = %task_id, error = %e, "Task worker panicked");
                        registry.update(&task_id, |job| {
                            settle(
                                job,
                                JobStatus::Failed,
                                -1,
                                "task_failed",
                                json!({ "reason": "worker_panicked" }),
                            );
                        });
                    }
                }
                Err(_) => warn!(task_id = %task_id, "Dispatcher closed before task started"),
            }
            cancels.lock().remove(&task_id);
        });

        Ok(Submission {
            task_id,
            timeout_seconds,
        })
    }

    /// Request cancellation. A queued job is cancelled on the spot; a
    /// running job has its process group killed and settles as `cancelled`
    /// shortly after. Returns the job's status after the request.
    pub fn cancel(&self, task_id: &str) -> Result<JobStatus, CancelError> {
        let status = self
            .registry
            .update(task_id, |job| match job.status {
                JobStatus::Queued => {
                    settle(
                        job,
                        JobStatus::Cancelled,
                        -1,
                        "task_cancelled",
                        json!({ "stage": "queued" }),
                    );
                    Ok(JobStatus::Cancelled)
                }
                JobStatus::Running => Ok(JobStatus::Running),
                status => Err(CancelError::AlreadyFinished {
                    id: task_id.to_string(),
                    status,
                }),
            })
            .ok_or_else(|| CancelError::NotFound(task_id.to_string()))??;

        if let Some(token) = self.cancels.lock().get(task_id) {
            token.cancel();
        }
        info!(task_id, %status, "Task cancellation requested");
        Ok(status)
    }

    /// Fire every outstanding cancellation token.
    pub fn cancel_all(&self) -> usize {
        let cancels = self.cancels.lock();
        for token in cancels.values() {
            token.cancel();
        }
        cancels.len()
    }
}

/// One job's background execution.
struct Worker {
    registry: Arc<TaskRegistry>,
    profile: Arc<SandboxProfile>,
    task_id: String,
    /// Executable found at submit time; `argv[0]` is kept as the caller wrote it.
    program: PathBuf,
    argv: Vec<String>,
    timeout_seconds: u64,
    token: CancellationToken,
}

impl Worker {
    fn execute(self) {
        let id = self.task_id.as_str();
        let started = self
            .registry
            .update(id, |job| {
                if self.token.is_cancelled() {
                    if job.status == JobStatus::Queued {
                        settle(
                            job,
                            JobStatus::Cancelled,
                            -1,
                            "task_cancelled",
                            json!({ "stage": "queued" }),
                        );
                    }
                    return false;
                }
                if job.transition(JobStatus::Running).is_err() {
                    return false;
                }
                job.metrics.start_time_ms = now_ms();
                job.log_event("task_started", json!({}));
                true
            })
            .unwrap_or(false);
        if !started {
            debug!(task_id = id, "Task no longer runnable, skipping");
            return;
        }

        let Some((command, args)) = self.argv.split_first() else {
            return;
        };
        let result = sandbox::run_program(
            &self.program,
            command,
            args,
            self.timeout_seconds,
            &self.profile,
            &self.token,
            |pid| {
                self.registry.update(id, |job| {
                    job.pid = pid;
                    job.log_event("process_spawned", json!({ "pid": pid }));
                });
            },
        );
        let end_ms = now_ms();

        self.registry
            .update(id, |job| record_outcome(job, result, end_ms));
        if let Some(job) = self.registry.get(id) {
            info!(
                task_id = id,
                status = %job.status,
                exit_code = job.exit_code,
                duration_ms = job.metrics.duration_ms,
                "Task finished"
            );
        }
    }
}

fn record_outcome(job: &mut Job, result: Result<Execution, SpawnError>, end_ms: i64) {
    let execution = match result {
        Ok(execution) => execution,
        Err(e) => {
            warn!(task_id = %job.task_id, error = %e, "Task failed to start");
            job.stderr = e.to_string();
            job.metrics.finish(end_ms, &ResourceUsage::default(), 0);
            settle(
                job,
                JobStatus::Failed,
                -1,
                "task_failed",
                json!({ "reason": e.reason(), "error": e.to_string() }),
            );
            return;
        }
    };

    job.stdout = execution.stdout_lossy();
    job.stderr = execution.stderr_lossy();
    job.metrics
        .finish(end_ms, &execution.usage, execution.io_bytes());

    match execution.outcome {
        ExitOutcome::Exited(0) => settle(
            job,
            JobStatus::Completed,
            0,
            "task_completed",
            json!({ "exit_code": 0 }),
        ),
        ExitOutcome::Exited(code) => settle(
            job,
            JobStatus::Failed,
            code,
            "task_failed",
            json!({ "exit_code": code }),
        ),
        ExitOutcome::Signaled(signal) => settle(
            job,
            JobStatus::Failed,
            128 + signal,
            "task_failed",
            json!({ "signal": signal }),
        ),
        ExitOutcome::TimedOut => {
            let timeout_seconds = job.timeout_seconds;
            settle(
                job,
                JobStatus::Timeout,
                -1,
                "task_timeout",
                json!({ "timeout_seconds": timeout_seconds }),
            )
        }
        ExitOutcome::Cancelled => settle(
            job,
            JobStatus::Cancelled,
            -1,
            "task_cancelled",
            json!({ "stage": "running" }),
        ),
    }
}

fn settle(job: &mut Job, status: JobStatus, exit_code: i32, event: &str, data: serde_json::Value) {
    if let Err(e) = job.transition(status) {
        warn!(task_id = %job.task_id, error = %e, "Dropping late status update");
        return;
    }
    job.exit_code = exit_code;
    if job.metrics.end_time_ms == 0 {
        job.metrics.end_time_ms = now_ms();
    }
    job.log_event(event, data);
}

/// Check that `command` names an executable file and return the path the
/// job will exec. Bare names are looked up in the child's `PATH`, inside the
/// chroot when one is configured.
pub fn resolve_binary(command: &str, chroot: Option<&Path>) -> Result<PathBuf, SubmitError> {
    sandbox::resolve_program(command, chroot).map_err(|e| match e {
        SpawnError::EmptyCommand => SubmitError::EmptyCommand,
        SpawnError::NotExecutable(cmd) => SubmitError::NotExecutable(cmd),
        _ => SubmitError::BinaryNotFound(command.to_string()),
    })
}
