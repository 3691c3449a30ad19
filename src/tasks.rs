//! Priority task runner
//!
//! A small fixed pool of workers drains six priority lanes. Higher lanes
//! preempt the *scheduling* of lower ones, never an executing task. Long
//! jobs stay cooperative by finishing early and re-submitting a continuation
//! task carrying their remaining work, so a bulk crawl cannot starve a
//! user-visible load.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const LANE_COUNT: usize = 6;

/// Scheduling lanes, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecPriority {
    /// User-initiated loads that block something visible
    P0UserImmediate = 0,
    /// User-initiated but latent (filter toggles etc.)
    P1UserLatent = 1,
    /// Background prefetch
    P2BackgroundPrefetch = 2,
    /// Applying live-monitor updates
    P3LiveUpdate = 3,
    /// Bulk local disk crawl
    P4DiskCrawl = 4,
    /// Full cloud tree download
    P5CloudDownload = 5,
}

pub struct Task {
    pub priority: ExecPriority,
    pub name: String,
    fut: BoxFuture<'static, ()>,
}

impl Task {
    pub fn new<F>(priority: ExecPriority, name: impl Into<String>, fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            priority,
            name: name.into(),
            fut: Box::pin(fut),
        }
    }
}

pub struct TaskRunner {
    lanes: Mutex<[VecDeque<Task>; LANE_COUNT]>,
    notify: Notify,
    idle_notify: Notify,
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    was_shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let runner = Arc::new(Self {
            lanes: Mutex::new(Default::default()),
            notify: Notify::new(),
            idle_notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            was_shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let mut workers = runner.workers.lock().unwrap();
        for n in 0..worker_count.max(1) {
            let this = runner.clone();
            workers.push(tokio::spawn(async move {
                this.worker_loop(n).await;
            }));
        }
        drop(workers);

        runner
    }

    pub fn submit(&self, task: Task) {
        if self.was_shutdown.load(Ordering::SeqCst) {
            debug!("Dropping task '{}' submitted after shutdown", task.name);
            return;
        }
        let lane = task.priority as usize;
        self.lanes.lock().unwrap()[lane].push_back(task);
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.was_shutdown.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst) + self.in_flight.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: workers exit at their next pop.
    pub fn shutdown(&self) {
        info!("Shutting down task runner");
        self.was_shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.idle_notify.notify_waiters();
    }

    /// Wait until every queued and running task has finished. Intended for
    /// tests and for CLI commands that must not exit mid-scan.
    pub async fn wait_idle(&self) {
        loop {
            if self.pending_count() == 0 || self.is_shutdown() {
                return;
            }
            let notified = self.idle_notify.notified();
            if self.pending_count() == 0 || self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }

    fn pop_next(&self) -> Option<Task> {
        let mut lanes = self.lanes.lock().unwrap();
        for lane in lanes.iter_mut() {
            if let Some(task) = lane.pop_front() {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                return Some(task);
            }
        }
        None
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!("Task worker {worker_id} started");
        loop {
            if self.is_shutdown() {
                break;
            }
            match self.pop_next() {
                Some(task) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    debug!("Worker {worker_id} running '{}' (p{})", task.name, task.priority as usize);
                    task.fut.await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.idle_notify.notify_waiters();
                }
                None => {
                    let notified = self.notify.notified();
                    if self.pop_next_available() || self.is_shutdown() {
                        continue;
                    }
                    notified.await;
                }
            }
        }
        debug!("Task worker {worker_id} exited");
    }

    fn pop_next_available(&self) -> bool {
        self.queued.load(Ordering::SeqCst) > 0
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.was_shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let runner = TaskRunner::new(2);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            runner.submit(Task::new(ExecPriority::P2BackgroundPrefetch, "inc", async move {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        runner.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        runner.shutdown();
    }

    #[tokio::test]
    async fn higher_priority_lane_drains_first() {
        // One worker so ordering is observable.
        let runner = TaskRunner::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Park the worker so the queue can fill before anything runs.
        let gate = Arc::new(Notify::new());
        let g = gate.clone();
        runner.submit(Task::new(ExecPriority::P0UserImmediate, "gate", async move {
            g.notified().await;
        }));
        tokio::task::yield_now().await;

        for (priority, tag) in [
            (ExecPriority::P5CloudDownload, "p5"),
            (ExecPriority::P0UserImmediate, "p0"),
            (ExecPriority::P3LiveUpdate, "p3"),
        ] {
            let order = order.clone();
            runner.submit(Task::new(priority, tag, async move {
                order.lock().unwrap().push(tag);
            }));
        }

        gate.notify_one();
        runner.wait_idle().await;
        assert_eq!(*order.lock().unwrap(), vec!["p0", "p3", "p5"]);
        runner.shutdown();
    }

    #[tokio::test]
    async fn continuation_tasks_reenter_the_queue() {
        let runner = TaskRunner::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        fn step(runner: Arc<TaskRunner>, counter: Arc<AtomicU32>, remaining: u32) {
            runner.clone().submit(Task::new(
                ExecPriority::P4DiskCrawl,
                "step",
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if remaining > 1 {
                        step(runner, counter, remaining - 1);
                    }
                },
            ));
        }

        step(runner.clone(), counter.clone(), 5);
        runner.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        runner.shutdown();
    }
}
