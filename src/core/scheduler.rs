//! Two-queue task scheduler with a bounded intake feeder.
//!
//! Jobs enter a pending backlog. A feeder thread moves them into the bounded
//! Normal queue a chunk at a time, pausing whenever the admission gate is
//! closed. Escalated jobs go straight to the Retry queue, which `next()`
//! always drains first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::{Job, JobStatus, Priority};
use crate::util::Shutdown;

/// Upper bound on any single condvar wait, so the stop signal is re-checked.
pub(crate) const STOP_POLL: Duration = Duration::from_millis(100);

/// Something the feeder must pass before pulling more work into the Normal queue.
pub trait FeedGate: Send + Sync {
    /// Block while intake is paused. Returns `false` if the run stopped while waiting.
    fn wait_for_admission(&self, shutdown: &Shutdown) -> bool;
}

/// Gate that never pauses.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

impl FeedGate for OpenGate {
    fn wait_for_admission(&self, shutdown: &Shutdown) -> bool {
        !shutdown.is_stopped()
    }
}

/// Sizing for the Normal queue and feeder.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerLimits {
    /// Maximum jobs held in the Normal queue.
    pub normal_capacity: usize,
    /// Jobs moved from the backlog per feeder step.
    pub feed_chunk: usize,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            normal_capacity: 64,
            feed_chunk: 10,
        }
    }
}

/// Snapshot of scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs still in the backlog.
    pub backlog: usize,
    /// Jobs in the Normal queue.
    pub normal_depth: usize,
    /// Jobs in the Retry queue.
    pub retry_depth: usize,
    /// Jobs handed out from the Normal queue.
    pub normal_dispatched: u64,
    /// Jobs handed out from the Retry queue.
    pub retry_dispatched: u64,
    /// Jobs pushed onto the Retry queue.
    pub retry_enqueued: u64,
    /// Times the Retry queue went from empty to non-empty.
    pub retry_activations: u64,
    /// Jobs handed back by workers that stopped before dispatching them.
    pub returned: u64,
}

struct Queues {
    retry: VecDeque<Job>,
    normal: VecDeque<Job>,
    stopped: bool,
}

#[derive(Default)]
struct Counters {
    normal_dispatched: AtomicU64,
    retry_dispatched: AtomicU64,
    retry_enqueued: AtomicU64,
    retry_activations: AtomicU64,
    returned: AtomicU64,
}

/// Scheduler shared by all workers.
pub struct TaskScheduler {
    limits: SchedulerLimits,
    backlog: Mutex<VecDeque<Job>>,
    /// Signaled when the backlog gains work or the scheduler stops.
    fed: Condvar,
    queues: Mutex<Queues>,
    /// Signaled on enqueue and stop.
    ready: Condvar,
    /// Signaled when the Normal queue drops below capacity.
    space: Condvar,
    feeder_done: AtomicBool,
    counters: Counters,
    shutdown: Shutdown,
}

impl TaskScheduler {
    /// Create a scheduler bound to the run's stop signal.
    #[must_use]
    pub fn new(limits: SchedulerLimits, shutdown: Shutdown) -> Self {
        let limits = SchedulerLimits {
            normal_capacity: limits.normal_capacity.max(1),
            feed_chunk: limits.feed_chunk.max(1),
        };
        Self {
            limits,
            backlog: Mutex::new(VecDeque::new()),
            fed: Condvar::new(),
            queues: Mutex::new(Queues {
                retry: VecDeque::new(),
                normal: VecDeque::with_capacity(limits.normal_capacity),
                stopped: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
            feeder_done: AtomicBool::new(false),
            counters: Counters::default(),
            shutdown,
        }
    }

    /// Seed the backlog in bulk.
    pub fn extend(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut backlog = self.backlog.lock();
        backlog.extend(jobs);
        tracing::debug!(backlog = backlog.len(), "backlog seeded");
        drop(backlog);
        self.fed.notify_one();
    }

    /// Add a job. `Normal` goes through the backlog and feeder; `Retry`
    /// lands directly on the Retry queue.
    pub fn enqueue(&self, mut job: Job, priority: Priority) {
        job.status = JobStatus::Pending;
        match priority {
            Priority::Normal => {
                self.backlog.lock().push_back(job);
                self.fed.notify_one();
            }
            Priority::Retry => {
                let mut queues = self.queues.lock();
                if queues.retry.is_empty() {
                    self.counters.retry_activations.fetch_add(1, Ordering::Relaxed);
                }
                queues.retry.push_back(job);
                drop(queues);
                self.counters.retry_enqueued.fetch_add(1, Ordering::Relaxed);
                self.ready.notify_one();
            }
        }
    }

    /// Put back a job that was handed out but never attempted.
    ///
    /// The job goes to the front of the queue it came from, so it counts as
    /// undispatched and is picked up first if the scheduler keeps running.
    pub fn return_undispatched(&self, mut job: Job) {
        job.status = JobStatus::Pending;
        let mut queues = self.queues.lock();
        if job.retry_depth() > 0 {
            queues.retry.push_front(job);
        } else {
            queues.normal.push_front(job);
        }
        drop(queues);
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        self.ready.notify_one();
    }

    /// Block until a job is ready, preferring the Retry queue.
    ///
    /// Returns `None` once the scheduler is stopped, either by [`Self::stop`]
    /// or by the run's stop signal.
    pub fn next(&self) -> Option<Job> {
        let mut queues = self.queues.lock();
        loop {
            if queues.stopped || self.shutdown.is_stopped() {
                return None;
            }
            if let Some(mut job) = queues.retry.pop_front() {
                self.counters.retry_dispatched.fetch_add(1, Ordering::Relaxed);
                job.status = JobStatus::InFlight;
                return Some(job);
            }
            if let Some(mut job) = queues.normal.pop_front() {
                drop(queues);
                self.space.notify_one();
                self.counters.normal_dispatched.fetch_add(1, Ordering::Relaxed);
                job.status = JobStatus::InFlight;
                return Some(job);
            }
            let _ = self.ready.wait_for(&mut queues, STOP_POLL);
        }
    }

    /// Non-blocking variant of [`Self::next`].
    pub fn try_next(&self) -> Option<Job> {
        let mut queues = self.queues.lock();
        if queues.stopped {
            return None;
        }
        let job = queues.retry.pop_front().map(|j| (j, true)).or_else(|| queues.normal.pop_front().map(|j| (j, false)));
        drop(queues);
        job.map(|(mut job, retry)| {
            if retry {
                self.counters.retry_dispatched.fetch_add(1, Ordering::Relaxed);
            } else {
                self.space.notify_one();
                self.counters.normal_dispatched.fetch_add(1, Ordering::Relaxed);
            }
            job.status = JobStatus::InFlight;
            job
        })
    }

    /// Stop handing out jobs and wake every blocked caller.
    pub fn stop(&self) {
        self.queues.lock().stopped = true;
        self.ready.notify_all();
        self.space.notify_all();
        self.fed.notify_all();
    }

    /// Whether [`Self::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.queues.lock().stopped
    }

    /// Whether the feeder is idle on an empty backlog, or has exited.
    #[must_use]
    pub fn is_feeder_done(&self) -> bool {
        self.feeder_done.load(Ordering::Acquire)
    }

    /// Jobs not yet dispatched (backlog plus both queues).
    #[must_use]
    pub fn undispatched(&self) -> usize {
        let backlog = self.backlog.lock().len();
        let queues = self.queues.lock();
        backlog + queues.retry.len() + queues.normal.len()
    }

    /// Move one chunk from the backlog into the Normal queue.
    ///
    /// Returns `false` when the backlog is empty or the run stopped.
    pub fn feed_once(&self, gate: &dyn FeedGate) -> bool {
        if !gate.wait_for_admission(&self.shutdown) {
            return false;
        }

        let room = {
            let mut queues = self.queues.lock();
            loop {
                if queues.stopped || self.shutdown.is_stopped() {
                    return false;
                }
                let room = self.limits.normal_capacity.saturating_sub(queues.normal.len());
                if room > 0 {
                    break room.min(self.limits.feed_chunk);
                }
                let _ = self.space.wait_for(&mut queues, STOP_POLL);
            }
        };

        let chunk: Vec<Job> = {
            let mut backlog = self.backlog.lock();
            let take = room.min(backlog.len());
            backlog.drain(..take).collect()
        };
        if chunk.is_empty() {
            return false;
        }

        let moved = chunk.len();
        self.queues.lock().normal.extend(chunk);
        if moved == 1 {
            self.ready.notify_one();
        } else {
            self.ready.notify_all();
        }
        true
    }

    /// Run the feeder until the scheduler stops.
    ///
    /// An empty backlog parks the feeder rather than ending it, so jobs
    /// enqueued later with [`Priority::Normal`] still reach the Normal queue.
    pub fn run_feeder(&self, gate: &dyn FeedGate) {
        tracing::debug!("feeder started");
        loop {
            if self.feed_once(gate) {
                continue;
            }
            if self.is_halted() || !self.wait_for_backlog() {
                break;
            }
        }
        self.feeder_done.store(true, Ordering::Release);
        tracing::debug!("feeder finished");
    }

    fn is_halted(&self) -> bool {
        self.queues.lock().stopped || self.shutdown.is_stopped()
    }

    /// Park until the backlog has work. Returns `false` if the scheduler
    /// stopped first.
    fn wait_for_backlog(&self) -> bool {
        let mut backlog = self.backlog.lock();
        while backlog.is_empty() {
            self.feeder_done.store(true, Ordering::Release);
            if self.is_halted() {
                return false;
            }
            let _ = self.fed.wait_for(&mut backlog, STOP_POLL);
        }
        self.feeder_done.store(false, Ordering::Release);
        true
    }

    /// Spawn [`Self::run_feeder`] on its own thread.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread could not be spawned.
    pub fn spawn_feeder(
        self: &Arc<Self>,
        gate: Arc<dyn FeedGate>,
    ) -> std::io::Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        thread::Builder::new()
            .name("harvest-feeder".into())
            .spawn(move || scheduler.run_feeder(gate.as_ref()))
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let backlog = self.backlog.lock().len();
        let queues = self.queues.lock();
        SchedulerStats {
            backlog,
            normal_depth: queues.normal.len(),
            retry_depth: queues.retry.len(),
            normal_dispatched: self.counters.normal_dispatched.load(Ordering::Relaxed),
            retry_dispatched: self.counters.retry_dispatched.load(Ordering::Relaxed),
            retry_enqueued: self.counters.retry_enqueued.load(Ordering::Relaxed),
            retry_activations: self.counters.retry_activations.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
        }
    }
}
