//! Task registry: the single source of truth for job state.

use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::job::{now_ms, Job, JobStatus};

/// Mirrors each job to `<dir>/<task_id>.json`, rewritten in full.
#[derive(Debug, Clone)]
pub struct TimelineStore {
    dir: PathBuf,
}

impl TimelineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn persist(&self, job: &Job) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let body = serde_json::to_vec_pretty(job)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", job.task_id));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.path_for(&job.task_id))
    }

    /// Delete a job's file. A file that is already gone is not an error.
    pub fn remove(&self, task_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(task_id)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Every parseable job file in the directory. Unreadable files are
    /// skipped with a warning.
    pub fn load_all(&self) -> Vec<Job> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "Cannot read job log directory");
                return Vec::new();
            }
        };

        entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let parsed = fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| {
                        serde_json::from_slice::<Job>(&bytes).map_err(|e| e.to_string())
                    });
                match parsed {
                    Ok(job) => Some(job),
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Skipping unreadable job log");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Concurrency-safe map of job id to job.
///
/// Reads hand out clones. `update` is the only mutation path after `create`;
/// when a mutation appends timeline events the job file is rewritten before
/// the lock is released, so the on-disk history is never out of order.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Job>>,
    store: Option<TimelineStore>,
}

impl TaskRegistry {
    pub fn new(store: Option<TimelineStore>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn store(&self) -> Option<&TimelineStore> {
        self.store.as_ref()
    }

    pub fn create(&self, job: Job) -> Result<(), RegistryError> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&job.task_id) {
            return Err(RegistryError::Duplicate(job.task_id));
        }
        if !job.timeline.is_empty() {
            self.mirror(&job);
        }
        debug!(task_id = %job.task_id, "Task registered");
        tasks.insert(job.task_id.clone(), job);
        Ok(())
    }

    pub fn get(&self, task_id: &str) -> Option<Job> {
        self.tasks.read().get(task_id).cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.read().contains_key(task_id)
    }

    /// Atomic read-modify-write. Returns `None` if the job is gone.
    pub fn update<R>(&self, task_id: &str, mutate: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut tasks = self.tasks.write();
        let job = tasks.get_mut(task_id)?;
        let events_before = job.timeline.len();
        let result = mutate(job);
        if job.timeline.len() != events_before {
            self.mirror(job);
        }
        Some(result)
    }

    /// Up to `limit` jobs, most recently created first.
    pub fn list(&self, limit: usize) -> Vec<Job> {
        let mut jobs = self.snapshot();
        jobs.sort_by_key(|job| std::cmp::Reverse(job.order_key()));
        jobs.truncate(limit);
        jobs
    }

    pub fn snapshot(&self) -> Vec<Job> {
        self.tasks.read().values().cloned().collect()
    }

    /// Drop a job from memory and delete its file.
    pub fn remove(&self, task_id: &str) -> Option<Job> {
        let removed = self.tasks.write().remove(task_id);
        if removed.is_some() {
            self.forget(task_id);
        }
        removed
    }

    /// Remove every job matching `evict`, along with its file, and return
    /// their ids.
    pub fn remove_where(&self, evict: impl Fn(&Job) -> bool) -> Vec<String> {
        let doomed: Vec<String> = {
            let mut tasks = self.tasks.write();
            let doomed: Vec<String> = tasks
                .values()
                .filter(|job| evict(job))
                .map(|job| job.task_id.clone())
                .collect();
            for id in &doomed {
                tasks.remove(id);
            }
            doomed
        };
        for id in &doomed {
            self.forget(id);
        }
        doomed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Reload jobs persisted by a previous process. Jobs that were still
    /// queued or running when it died are marked failed. Finished jobs
    /// created more than `retention` ago have their files deleted instead.
    /// Returns the number of jobs loaded.
    pub fn recover(&self, retention: Duration) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let cutoff = now_ms() - retention.as_millis() as i64;
        let mut loaded = 0;
        let mut expired = 0;
        for mut job in store.load_all() {
            if self.contains(&job.task_id) {
                continue;
            }
            if !job.status.is_terminal() {
                let previous = job.status;
                if job.transition(JobStatus::Failed).is_ok() {
                    job.exit_code = -1;
                    if job.metrics.end_time_ms == 0 {
                        job.metrics.end_time_ms = now_ms();
                    }
                    if job.stderr.is_empty() {
                        job.stderr = "interrupted by service restart".to_string();
                    }
                    job.log_event("task_interrupted", json!({ "previous_status": previous }));
                }
            }
            if job.status.is_terminal() && job.created_at_ms < cutoff {
                self.forget(&job.task_id);
                expired += 1;
                continue;
            }
            if self.create(job).is_ok() {
                loaded += 1;
            }
        }
        if loaded > 0 || expired > 0 {
            info!(loaded, expired, dir = ?store.dir(), "Recovered tasks from job logs");
        }
        loaded
    }

    fn forget(&self, task_id: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(task_id) {
                warn!(task_id, error = %e, "Failed to delete job log");
            }
        }
    }

    fn mirror(&self, job: &Job) {
        if let Some(store) = &self.store {
            if let Err(e) = store.persist(job) {
                warn!(task_id = %job.task_id, error = %e, "Failed to write job log");
            }
        }
    }
}
