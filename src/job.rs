//! Job records and their lifecycle rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::JobError;
use crate::sandbox::ResourceUsage;

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `task-<unix_ms>-<seq>`. The sequence is process-wide, so two calls never
/// return the same id.
pub fn next_task_id() -> String {
    format!("task-{}-{}", now_ms(), TASK_SEQ.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Timeout => write!(f, "timeout"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Derived execution metrics, filled in once when the job finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub duration_ms: i64,
    pub peak_memory_kb: i64,
    pub cpu_percent: u32,
    pub io_throughput_mb_s: f64,
}

impl JobMetrics {
    /// Record the end of a run. Wall time is floored at 1ms.
    pub fn finish(&mut self, end_time_ms: i64, usage: &ResourceUsage, io_bytes: usize) {
        self.end_time_ms = end_time_ms;
        self.duration_ms = (end_time_ms - self.start_time_ms).max(0);

        let wall_s = (self.duration_ms as f64 / 1000.0).max(0.001);
        let cpu_s = (usage.user_time_us + usage.system_time_us) as f64 / 1_000_000.0;

        self.peak_memory_kb = usage.max_rss_kb;
        self.cpu_percent = (cpu_s / wall_s * 100.0).clamp(0.0, 100.0) as u32;
        self.io_throughput_mb_s = io_bytes as f64 / (1024.0 * 1024.0) / wall_s;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts_ms: i64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub task_id: String,
    pub status: JobStatus,
    pub pid: i32,
    pub command: Vec<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
    pub created_at_ms: i64,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub metrics: JobMetrics,
    #[serde(default)]
    pub timeline: Vec<TimelineEvent>,
}

impl Job {
    pub fn new(command: Vec<String>, timeout_seconds: u64) -> Self {
        Self::with_id(next_task_id(), command, timeout_seconds)
    }

    pub fn with_id(task_id: String, command: Vec<String>, timeout_seconds: u64) -> Self {
        Self {
            task_id,
            status: JobStatus::Queued,
            pid: -1,
            command,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            created_at_ms: now_ms(),
            timeout_seconds,
            metrics: JobMetrics::default(),
            timeline: Vec::new(),
        }
    }

    /// Move to `to`. Terminal states are final and nothing moves back to
    /// `queued`.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        let allowed = match (self.status, to) {
            (from, _) if from.is_terminal() => false,
            (_, JobStatus::Queued) => false,
            (JobStatus::Running, JobStatus::Running) => false,
            _ => true,
        };
        if !allowed {
            return Err(JobError::IllegalTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    pub fn log_event(&mut self, event: &str, data: Value) {
        self.timeline.push(TimelineEvent {
            ts_ms: now_ms(),
            event: event.to_string(),
            data,
        });
    }

    /// Sort key giving creation order: `(created_at_ms, seq)`.
    pub fn order_key(&self) -> (i64, u64) {
        let seq = self
            .task_id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        (self.created_at_ms, seq)
    }

    /// Seconds since creation, frozen at the end time once the job is
    /// terminal.
    pub fn elapsed_seconds(&self) -> f64 {
        let until = if self.status.is_terminal() && self.metrics.end_time_ms > 0 {
            self.metrics.end_time_ms
        } else {
            now_ms()
        };
        ((until - self.created_at_ms) as f64 / 1000.0).max(0.0)
    }

    pub fn snapshot(&self) -> JobSnapshot<'_> {
        JobSnapshot {
            job: self,
            elapsed_seconds: self.elapsed_seconds(),
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            task_id: self.task_id.clone(),
            status: self.status,
            pid: self.pid,
            command: self.command.clone(),
            exit_code: self.exit_code,
            created_at_ms: self.created_at_ms,
            elapsed_seconds: self.elapsed_seconds(),
            timeout_seconds: self.timeout_seconds,
            metrics: self.metrics.clone(),
        }
    }
}

/// Full job view served by `/status/:id`.
#[derive(Debug, Serialize)]
pub struct JobSnapshot<'a> {
    #[serde(flatten)]
    pub job: &'a Job,
    pub elapsed_seconds: f64,
}

/// Job view without output or timeline, served by `/tasks`.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub task_id: String,
    pub status: JobStatus,
    pub pid: i32,
    pub command: Vec<String>,
    pub exit_code: i32,
    pub created_at_ms: i64,
    pub elapsed_seconds: f64,
    pub timeout_seconds: u64,
    pub metrics: JobMetrics,
}
