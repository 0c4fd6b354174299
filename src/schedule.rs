//! Deferred-job seam.
//!
//! Delayed and throttled queue replays are booked through a [`JobScheduler`]
//! rather than run on internal timers; the host application owns execution.
//! Replacement is the only cancellation primitive: booking a new replay for
//! a queue first cancels whatever job was booked for it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tracing::debug;

use crate::lock::mutex_lock;

/// The work a job performs when its run time arrives.
pub type JobTask = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// One booked job.
pub struct JobSpec {
    /// Replacement key: `cancel_matching` removes jobs sharing this tag.
    pub tag: String,
    /// Processing-affinity queue name (which worker pool runs it).
    pub queue: String,
    /// Lower runs first among jobs due at the same time.
    pub priority: i32,
    pub run_at: OffsetDateTime,
    pub task: JobTask,
}

impl JobSpec {
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        run_at: OffsetDateTime,
        task: JobTask,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            priority: 0,
            run_at,
            task,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("run_at", &self.run_at)
            .finish_non_exhaustive()
    }
}

/// Facility the engine books deferred replays through.
pub trait JobScheduler: Send + Sync {
    fn enqueue(&self, job: JobSpec);

    /// Remove every booked job whose tag matches. Returns how many were
    /// cancelled.
    fn cancel_matching(&self, tag: &str) -> usize;
}

/// In-memory [`JobScheduler`] for tests and embedders without a job backend.
/// Execution is host-driven: call [`run_due`](Self::run_due) to run jobs
/// whose time has come.
pub struct MemoryScheduler {
    jobs: Mutex<Vec<JobSpec>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.jobs, "jobs.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tags(&self) -> Vec<String> {
        mutex_lock(&self.jobs, "jobs.tags")
            .iter()
            .map(|job| job.tag.clone())
            .collect()
    }

    pub fn next_run_at(&self) -> Option<OffsetDateTime> {
        mutex_lock(&self.jobs, "jobs.next_run_at")
            .iter()
            .map(|job| job.run_at)
            .min()
    }

    /// Run every job due at or before `now`, in (run_at, priority) order.
    /// Tasks may book further jobs while running. Returns how many ran.
    pub async fn run_due(&self, now: OffsetDateTime) -> usize {
        let mut due = {
            let mut jobs = mutex_lock(&self.jobs, "jobs.run_due");
            let mut due = Vec::new();
            let mut rest = Vec::new();
            for job in jobs.drain(..) {
                if job.run_at <= now {
                    due.push(job);
                } else {
                    rest.push(job);
                }
            }
            *jobs = rest;
            due
        };
        due.sort_by_key(|job| (job.run_at, job.priority));

        let count = due.len();
        for job in due {
            debug!(target: "tessella::schedule", tag = %job.tag, "running deferred job");
            (job.task)().await;
        }
        count
    }
}

impl Default for MemoryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl JobScheduler for MemoryScheduler {
    fn enqueue(&self, job: JobSpec) {
        debug!(
            target: "tessella::schedule",
            tag = %job.tag,
            queue = %job.queue,
            run_at = %job.run_at,
            "deferred job booked"
        );
        mutex_lock(&self.jobs, "jobs.enqueue").push(job);
    }

    fn cancel_matching(&self, tag: &str) -> usize {
        let mut jobs = mutex_lock(&self.jobs, "jobs.cancel_matching");
        let before = jobs.len();
        jobs.retain(|job| job.tag != tag);
        let cancelled = before - jobs.len();
        if cancelled > 0 {
            debug!(target: "tessella::schedule", tag, cancelled, "deferred jobs replaced");
        }
        cancelled
    }
}
