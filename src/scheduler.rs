//! Time-based scheduler for one-shot and recurring housekeeping callbacks.
//!
//! A single OS thread sleeps on a condition variable until the earliest entry
//! is due, then fires it with the queue unlocked. Every registration carries
//! a generation number; cancelling or replacing an id retires its generation,
//! and popped entries whose generation is no longer live are dropped.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

type Action = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    execute_at: Instant,
    generation: u64,
    id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.execute_at
            .cmp(&other.execute_at)
            .then(self.generation.cmp(&other.generation))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Registration {
    generation: u64,
    interval: Option<Duration>,
    action: Action,
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Entry>>,
    live: HashMap<String, Registration>,
    next_generation: u64,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wake: Condvar,
}

pub struct TaskScheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Start the scheduler thread.
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = thread::Builder::new()
            .name("scheduler".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_loop(&shared)
            })?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Fire `action` once after `delay`. Replaces any entry with the same id.
    pub fn schedule_once<F>(&self, id: impl Into<String>, delay: Duration, action: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(id.into(), delay, None, Arc::new(action));
    }

    /// Fire `action` every `interval`, first after one interval. Replaces any
    /// entry with the same id.
    pub fn schedule_recurring<F>(&self, id: impl Into<String>, interval: Duration, action: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(id.into(), interval, Some(interval), Arc::new(action));
    }

    /// Returns false if nothing was scheduled under `id`. An action that is
    /// already running is not interrupted.
    pub fn cancel_task(&self, id: &str) -> bool {
        let removed = self.shared.queue.lock().live.remove(id).is_some();
        if removed {
            debug!(id, "Scheduled task cancelled");
        }
        removed
    }

    /// Ids with a live registration, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.queue.lock().live.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the thread. Pending entries are discarded.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopped {
                return;
            }
            queue.stopped = true;
            queue.live.clear();
            queue.heap.clear();
        }
        self.shared.wake.notify_all();

        if let Some(handle) = self.worker.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("Scheduler thread panicked");
            }
        }
        info!("Scheduler stopped");
    }

    fn insert(&self, id: String, delay: Duration, interval: Option<Duration>, action: Action) {
        let mut queue = self.shared.queue.lock();
        if queue.stopped {
            return;
        }
        queue.next_generation += 1;
        let generation = queue.next_generation;
        let replaced = queue
            .live
            .insert(
                id.clone(),
                Registration {
                    generation,
                    interval,
                    action,
                },
            )
            .is_some();
        queue.heap.push(Reverse(Entry {
            execute_at: Instant::now() + delay,
            generation,
            id: id.clone(),
        }));
        drop(queue);
        self.shared.wake.notify_one();
        debug!(id, ?delay, ?interval, replaced, "Task scheduled");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.stopped {
            return;
        }
        let due = match queue.heap.peek() {
            None => {
                shared.wake.wait(&mut queue);
                continue;
            }
            Some(Reverse(entry)) => entry.execute_at,
        };
        if due > Instant::now() {
            shared.wake.wait_until(&mut queue, due);
            continue;
        }

        let Some(Reverse(entry)) = queue.heap.pop() else {
            continue;
        };
        let Some(registration) = queue
            .live
            .get(&entry.id)
            .filter(|r| r.generation == entry.generation)
        else {
            continue;
        };
        let (action, interval) = (Arc::clone(&registration.action), registration.interval);
        // Recurring entries re-arm from the fire time, so a slow action never
        // triggers a burst of catch-up runs.
        match interval {
            Some(interval) => queue.heap.push(Reverse(Entry {
                execute_at: Instant::now() + interval,
                generation: entry.generation,
                id: entry.id.clone(),
            })),
            None => {
                queue.live.remove(&entry.id);
            }
        }

        MutexGuard::unlocked(&mut queue, || fire(&entry.id, &action));
    }
}

fn fire(id: &str, action: &Action) {
    match panic::catch_unwind(AssertUnwindSafe(|| action())) {
        Ok(Ok(())) => debug!(id, "Scheduled task ran"),
        Ok(Err(e)) => error!(id, error = %format!("{e:#}"), "Scheduled task failed"),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            error!(id, panic = %message, "Scheduled task panicked");
        }
    }
}
