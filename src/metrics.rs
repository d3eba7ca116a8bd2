//! Aggregate statistics over the current contents of the registry.

use serde::Serialize;

use crate::job::{Job, JobStatus};
use crate::registry::TaskRegistry;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Rollup {
    pub total_tasks: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    /// Mean duration of completed jobs only.
    pub avg_duration_ms: f64,
    pub peak_memory_kb: i64,
}

impl Rollup {
    pub fn from_jobs(jobs: &[Job]) -> Self {
        let mut rollup = Rollup {
            total_tasks: jobs.len(),
            ..Default::default()
        };
        let mut completed_ms = 0i64;

        for job in jobs {
            match job.status {
                JobStatus::Queued => rollup.queued += 1,
                JobStatus::Running => rollup.running += 1,
                JobStatus::Completed => {
                    rollup.completed += 1;
                    completed_ms += job.metrics.duration_ms;
                }
                JobStatus::Failed => rollup.failed += 1,
                JobStatus::Timeout => rollup.timeout += 1,
                JobStatus::Cancelled => rollup.cancelled += 1,
            }
            rollup.peak_memory_kb = rollup.peak_memory_kb.max(job.metrics.peak_memory_kb);
        }

        if rollup.completed > 0 {
            rollup.avg_duration_ms = completed_ms as f64 / rollup.completed as f64;
        }
        rollup
    }
}

pub fn aggregate(registry: &TaskRegistry) -> Rollup {
    Rollup::from_jobs(&registry.snapshot())
}
