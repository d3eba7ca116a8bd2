use futures_util::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jobsandbox::dispatcher::{Dispatcher, DispatcherConfig};
use jobsandbox::job::{now_ms, Job, JobStatus};
use jobsandbox::metrics;
use jobsandbox::registry::{TaskRegistry, TimelineStore};
use jobsandbox::sweeper;

fn sh(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

fn dispatcher_with(registry: TaskRegistry, max_concurrent_jobs: usize) -> Dispatcher {
    Dispatcher::new(
        Arc::new(registry),
        DispatcherConfig {
            max_concurrent_jobs,
            ..Default::default()
        },
    )
}

async fn wait_until(d: &Dispatcher, id: &str, done: impl Fn(&Job) -> bool) -> Job {
    for _ in 0..500 {
        let job = d.registry().get(id).expect("job registered");
        if done(&job) {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {id} never reached the expected state");
}

async fn wait_terminal(d: &Dispatcher, id: &str) -> Job {
    wait_until(d, id, |job| job.status.is_terminal()).await
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 4);
    let started = Instant::now();
    let sub = d.submit(sh("sleep 10"), Some(1)).unwrap();

    let job = wait_terminal(&d, &sub.task_id).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(job.status, JobStatus::Timeout);
    assert_eq!(job.exit_code, -1);
    assert_eq!(job.timeline.last().unwrap().event, "task_timeout");
    assert_eq!(job.timeline.last().unwrap().data["timeout_seconds"], 1);

    assert!(job.pid > 0);
    let gone = nix::sys::signal::kill(nix::unistd::Pid::from_raw(job.pid), None).is_err();
    assert!(gone, "pid {} still alive after timeout", job.pid);
}

#[tokio::test]
async fn signal_death_is_failed_with_shell_style_code() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 4);
    let sub = d.submit(sh("kill -9 $$"), Some(5)).unwrap();

    let job = wait_terminal(&d, &sub.task_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, 137);
    assert_eq!(job.timeline.last().unwrap().data["signal"], 9);
}

#[tokio::test]
async fn concurrent_jobs_keep_their_own_output() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 4);
    let ids: Vec<_> = (0..10)
        .map(|i| d.submit(sh(&format!("echo {i}")), Some(10)).unwrap().task_id)
        .collect();

    let jobs = join_all(ids.iter().map(|id| wait_terminal(&d, id))).await;
    for (i, job) in jobs.iter().enumerate() {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.stdout, format!("{i}\n"));
    }
    assert_eq!(metrics::aggregate(d.registry()).completed, 10);
}

#[tokio::test]
async fn exit_codes_map_to_statuses() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 4);
    let ok = d.submit(sh("exit 0"), Some(5)).unwrap();
    let bad = d.submit(sh("exit 42"), Some(5)).unwrap();

    let ok = wait_terminal(&d, &ok.task_id).await;
    let bad = wait_terminal(&d, &bad.task_id).await;
    assert_eq!((ok.status, ok.exit_code), (JobStatus::Completed, 0));
    assert_eq!((bad.status, bad.exit_code), (JobStatus::Failed, 42));
}

#[tokio::test]
async fn concurrency_limit_keeps_extra_jobs_queued() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 1);
    let first = d.submit(sh("sleep 2"), Some(10)).unwrap();
    let second = d.submit(sh("echo second"), Some(10)).unwrap();

    wait_until(&d, &first.task_id, |job| job.status == JobStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let waiting = d.registry().get(&second.task_id).unwrap();
    assert_eq!(waiting.status, JobStatus::Queued);
    assert_eq!(waiting.pid, -1);

    let second = wait_terminal(&d, &second.task_id).await;
    let first = wait_terminal(&d, &first.task_id).await;
    assert_eq!(second.stdout, "second\n");
    assert!(second.metrics.start_time_ms >= first.metrics.end_time_ms);
}

#[tokio::test]
async fn job_file_holds_the_full_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let store = TimelineStore::new(dir.path());
    let d = dispatcher_with(TaskRegistry::new(Some(store.clone())), 2);
    let sub = d.submit(sh("echo logged"), Some(5)).unwrap();
    wait_terminal(&d, &sub.task_id).await;

    let bytes = std::fs::read(store.path_for(&sub.task_id)).unwrap();
    let on_disk: Job = serde_json::from_slice(&bytes).unwrap();
    let events: Vec<_> = on_disk.timeline.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(
        events,
        ["task_submitted", "task_started", "process_spawned", "task_completed"]
    );
    assert_eq!(on_disk.status, JobStatus::Completed);
    assert_eq!(on_disk.stdout, "logged\n");
}

#[tokio::test]
async fn restart_marks_unfinished_jobs_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let store = TimelineStore::new(dir.path());

    let mut stuck = Job::new(vec!["/bin/sleep".into(), "60".into()], 60);
    stuck.transition(JobStatus::Running).unwrap();
    stuck.log_event("task_started", serde_json::json!({}));
    store.persist(&stuck).unwrap();

    let registry = TaskRegistry::new(Some(store));
    assert_eq!(registry.recover(Duration::from_secs(3600)), 1);
    let job = registry.get(&stuck.task_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.exit_code, -1);
    assert_eq!(job.timeline.last().unwrap().event, "task_interrupted");
}

#[tokio::test]
async fn sweep_evicts_only_expired_finished_jobs() {
    let d = dispatcher_with(TaskRegistry::in_memory(), 2);
    let done = d.submit(sh("true"), Some(5)).unwrap();
    let running = d.submit(sh("sleep 5"), Some(10)).unwrap();
    wait_terminal(&d, &done.task_id).await;
    wait_until(&d, &running.task_id, |job| job.status == JobStatus::Running).await;

    let later = now_ms() + 10_000;
    let evicted = sweeper::sweep(d.registry(), Duration::from_secs(5), later);
    assert_eq!(evicted, vec![done.task_id.clone()]);
    assert!(!d.registry().contains(&done.task_id));
    assert!(d.registry().contains(&running.task_id));

    d.cancel(&running.task_id).unwrap();
    wait_terminal(&d, &running.task_id).await;
}

#[tokio::test]
async fn swept_jobs_stay_gone_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = TimelineStore::new(dir.path());
    let d = dispatcher_with(TaskRegistry::new(Some(store.clone())), 2);
    let sub = d.submit(sh("true"), Some(5)).unwrap();
    wait_terminal(&d, &sub.task_id).await;
    assert!(store.path_for(&sub.task_id).exists());

    let evicted = sweeper::sweep(d.registry(), Duration::from_secs(5), now_ms() + 10_000);
    assert_eq!(evicted, vec![sub.task_id.clone()]);
    assert!(!store.path_for(&sub.task_id).exists());

    let restarted = TaskRegistry::new(Some(store));
    assert_eq!(restarted.recover(Duration::from_secs(3600)), 0);
    assert!(!restarted.contains(&sub.task_id));
}
