use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One evaluation job. `attempt` counts queue-level retries after a
/// retryable fetch failure; the scheduler always enqueues attempt 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub signal_id: String,
    pub attempt: u32,
}

impl Job {
    pub fn new(signal_id: impl Into<String>) -> Self {
        Self {
            signal_id: signal_id.into(),
            attempt: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// JobQueue — dedup + per-signal single-flight
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Job>,
    /// Signal ids currently in `ready`. A backed-up queue never accumulates
    /// more than one pending job per signal.
    queued: HashSet<String>,
    /// Signal ids currently held by a worker. Jobs arriving for these are
    /// parked and released on `complete`, so two workers never evaluate the
    /// same signal concurrently.
    in_flight: HashSet<String>,
    parked: Vec<Job>,
}

/// In-process work queue between the scheduler and the worker pool.
#[derive(Default)]
pub struct JobQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. Deduplicated against pending jobs for the same signal;
    /// parked if the signal is being evaluated right now.
    pub fn push(&self, job: Job) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.queued.contains(&job.signal_id) {
                return;
            }
            if inner.in_flight.contains(&job.signal_id) {
                if !inner.parked.iter().any(|j| j.signal_id == job.signal_id) {
                    inner.parked.push(job);
                }
                return;
            }
            inner.queued.insert(job.signal_id.clone());
            inner.ready.push_back(job);
        }
        self.notify.notify_one();
    }

    /// Wait for the next job. The returned signal id is marked in-flight
    /// until [`JobQueue::complete`] is called for it.
    pub async fn pop(&self) -> Job {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.try_pop() {
                return job;
            }
            notified.await;
        }
    }

    fn try_pop(&self) -> Option<Job> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let job = inner.ready.pop_front()?;
        inner.queued.remove(&job.signal_id);
        inner.in_flight.insert(job.signal_id.clone());
        Some(job)
    }

    /// Release a signal after its job finished, re-enqueueing any job that
    /// was parked behind it.
    pub fn complete(&self, signal_id: &str) {
        let released = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.in_flight.remove(signal_id);
            let pos = inner.parked.iter().position(|j| j.signal_id == signal_id);
            pos.map(|p| inner.parked.remove(p))
        };
        if let Some(job) = released {
            self.push(job);
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").ready.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
