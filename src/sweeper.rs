//! Periodic eviction of finished jobs past their retention window.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::job::now_ms;
use crate::registry::TaskRegistry;

/// Remove terminal jobs created more than `retention` before `now_ms`.
/// Queued and running jobs are never evicted.
pub fn sweep(registry: &TaskRegistry, retention: Duration, now_ms: i64) -> Vec<String> {
    let cutoff = now_ms - retention.as_millis() as i64;
    registry.remove_where(|job| job.status.is_terminal() && job.created_at_ms < cutoff)
}

/// Run `sweep` every `period` until `shutdown` fires.
pub fn spawn(
    registry: Arc<TaskRegistry>,
    retention: Duration,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Retention sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let evicted = sweep(&registry, retention, now_ms());
            if !evicted.is_empty() {
                info!(
                    count = evicted.len(),
                    remaining = registry.len(),
                    "Evicted expired tasks"
                );
                debug!(task_ids = ?evicted, "Evicted task ids");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus};

    fn job_at(id: &str, created_at_ms: i64, status: JobStatus) -> Job {
        let mut job = Job::with_id(id.into(), vec!["/bin/true".into()], 5);
        job.created_at_ms = created_at_ms;
        if status != JobStatus::Queued {
            if status != JobStatus::Running && status != JobStatus::Cancelled {
                job.transition(JobStatus::Running).unwrap();
            }
            job.transition(status).unwrap();
        }
        job
    }

    #[test]
    fn evicts_only_old_terminal_jobs() {
        let registry = TaskRegistry::in_memory();
        let now = 10_000_000;
        let hour = Duration::from_secs(3600);
        let old = now - 2 * 3_600_000;

        registry.create(job_at("old-done", old, JobStatus::Completed)).unwrap();
        registry.create(job_at("old-failed", old, JobStatus::Failed)).unwrap();
        registry.create(job_at("old-running", old, JobStatus::Running)).unwrap();
        registry.create(job_at("old-queued", old, JobStatus::Queued)).unwrap();
        registry.create(job_at("new-done", now - 1_000, JobStatus::Completed)).unwrap();

        let mut evicted = sweep(&registry, hour, now);
        evicted.sort();
        assert_eq!(evicted, ["old-done", "old-failed"]);
        assert!(registry.contains("old-running"));
        assert!(registry.contains("old-queued"));
        assert!(registry.contains("new-done"));
    }

    #[test]
    fn boundary_is_exclusive() {
        let registry = TaskRegistry::in_memory();
        registry
            .create(job_at("edge", 1_000, JobStatus::Timeout))
            .unwrap();
        assert!(sweep(&registry, Duration::from_millis(1_000), 2_000).is_empty());
        assert_eq!(sweep(&registry, Duration::from_millis(1_000), 2_001), ["edge"]);
    }

    #[tokio::test]
    async fn background_sweeper_evicts_and_stops() {
        let registry = Arc::new(TaskRegistry::in_memory());
        registry
            .create(job_at("stale", 0, JobStatus::Cancelled))
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = spawn(
            Arc::clone(&registry),
            Duration::from_secs(1),
            Duration::from_millis(20),
            shutdown.clone(),
        );
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }
}
