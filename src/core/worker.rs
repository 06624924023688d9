//! Worker threads: pull a job, borrow a session, drive the input ladder.
//!
//! Each worker owns a dedicated OS thread with its own current-thread tokio
//! runtime, so the async collaborator never shares an executor with the
//! caller.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::core::{
    EngineError, ExtractionResult, Extractor, Job, JobOutcome, JobStatus, OutcomeClass, PoolError, PooledHandle,
    Priority, Record, ResourcePool, SessionFactory, TaskScheduler,
};
use crate::util::Shutdown;

/// Backoff and timeout knobs for a worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    /// Single wait passed to [`ResourcePool::acquire`].
    pub acquire_timeout: Duration,
    /// First backoff delay after `Busy`.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
    /// Session-creation failures tolerated per job before giving up.
    pub create_retries: u32,
    /// Optional cap on a single extraction call.
    pub extract_timeout: Option<Duration>,
    /// Thread stack size.
    pub stack_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(2),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            create_retries: 5,
            extract_timeout: None,
            stack_size: 2 * 1024 * 1024,
        }
    }
}

impl WorkerSettings {
    /// Delay before the `attempt`-th retry (0-based), doubling up to the cap.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// What a worker thread reports when it exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker index.
    pub worker_id: usize,
    /// Outcomes emitted.
    pub outcomes: u64,
    /// Collaborator calls made (including escalated attempts).
    pub attempts: u64,
    /// Jobs pushed back onto the Retry queue.
    pub escalations: u64,
    /// Sessions retired after an extraction error.
    pub retired: u64,
    /// Jobs handed back to the scheduler unattempted because the run stopped.
    pub returned: u64,
}

/// Everything a worker borrows from the engine.
pub struct WorkerContext<F, X, R>
where
    F: SessionFactory,
    R: Record,
{
    /// Shared session pool.
    pub pool: Arc<ResourcePool<F>>,
    /// Shared scheduler.
    pub scheduler: Arc<TaskScheduler>,
    /// Collaborator; cloned per worker.
    pub extractor: X,
    /// Outcome channel to the collector.
    pub outcomes: Sender<JobOutcome<R>>,
    /// Run-wide stop signal.
    pub shutdown: Shutdown,
    /// Backoff and timeouts.
    pub settings: WorkerSettings,
}

impl<F, X, R> Clone for WorkerContext<F, X, R>
where
    F: SessionFactory,
    X: Clone,
    R: Record,
{
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            scheduler: Arc::clone(&self.scheduler),
            extractor: self.extractor.clone(),
            outcomes: self.outcomes.clone(),
            shutdown: self.shutdown.clone(),
            settings: self.settings,
        }
    }
}

enum Acquired<S> {
    Handle(PooledHandle<S>),
    GaveUp(String),
    /// The run stopped or the pool shut down before a session was in hand.
    Halted(&'static str),
}

/// A single worker bound to one engine run.
pub struct Worker<F, X, R>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    id: usize,
    ctx: WorkerContext<F, X, R>,
    report: WorkerReport,
    halted: bool,
    _record: PhantomData<fn() -> R>,
}

impl<F, X, R> Worker<F, X, R>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    /// Create a worker; nothing runs until [`Self::run`].
    #[must_use]
    pub fn new(id: usize, ctx: WorkerContext<F, X, R>) -> Self {
        Self {
            id,
            ctx,
            report: WorkerReport {
                worker_id: id,
                ..WorkerReport::default()
            },
            halted: false,
            _record: PhantomData,
        }
    }

    /// Counters so far.
    #[must_use]
    pub fn report(&self) -> &WorkerReport {
        &self.report
    }

    /// Pull jobs until the scheduler stops.
    pub fn run(mut self, rt: &tokio::runtime::Runtime) -> WorkerReport {
        debug!(worker_id = self.id, "worker started");
        while let Some(job) = self.ctx.scheduler.next() {
            let Some(outcome) = self.process(rt, job) else {
                if self.halted {
                    break;
                }
                continue;
            };
            self.report.outcomes += 1;
            if self.ctx.outcomes.send(outcome).is_err() {
                warn!(worker_id = self.id, "outcome channel closed, exiting");
                break;
            }
        }
        debug!(
            worker_id = self.id,
            outcomes = self.report.outcomes,
            attempts = self.report.attempts,
            "worker exiting"
        );
        self.report
    }

    /// Run one attempt of `job`. Returns `None` when the job was escalated
    /// onto the Retry queue, or handed back unattempted because the run
    /// stopped before a session was available.
    pub fn process(&mut self, rt: &tokio::runtime::Runtime, mut job: Job) -> Option<JobOutcome<R>> {
        let started = Instant::now();
        let mut handle = match self.acquire(rt) {
            Acquired::Handle(handle) if self.ctx.shutdown.is_stopped() => {
                self.ctx.pool.release(handle);
                self.hand_back(job, "stopped before dispatch");
                return None;
            }
            Acquired::Handle(handle) => handle,
            Acquired::Halted(reason) => {
                self.hand_back(job, reason);
                return None;
            }
            Acquired::GaveUp(reason) => {
                return Some(self.outcome(&job, OutcomeClass::Error, Vec::new(), Some(reason), started));
            }
        };

        self.report.attempts += 1;
        let target = job.current_input().to_owned();
        debug!(
            worker_id = self.id,
            job_id = job.id,
            handle_id = handle.id(),
            retry_depth = job.retry_depth(),
            "extracting"
        );

        let extractor = &self.ctx.extractor;
        let timeout = self.ctx.settings.extract_timeout;
        let result = rt.block_on(async {
            let call = extractor.extract(&target, handle.session_mut());
            match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(crate::core::ExtractError::Timeout(limit))),
                None => call.await,
            }
        });

        match result {
            Ok(ExtractionResult::Success(records)) => {
                self.ctx.pool.release(handle);
                if records.is_empty() {
                    warn!(worker_id = self.id, job_id = job.id, "collaborator reported success with no records");
                }
                job.status = JobStatus::Done;
                Some(self.outcome(&job, OutcomeClass::Success, records, None, started))
            }
            Ok(ExtractionResult::EmptyNoRetry) => {
                self.ctx.pool.release(handle);
                job.status = JobStatus::Failed;
                Some(self.outcome(&job, OutcomeClass::NoMatch, Vec::new(), None, started))
            }
            Ok(ExtractionResult::EmptyRetryable) => {
                self.ctx.pool.release(handle);
                if job.escalate() {
                    debug!(
                        worker_id = self.id,
                        job_id = job.id,
                        next_input = job.current_input(),
                        "escalating to next input"
                    );
                    self.report.escalations += 1;
                    self.ctx.scheduler.enqueue(job, Priority::Retry);
                    None
                } else {
                    job.status = JobStatus::Failed;
                    Some(self.outcome(&job, OutcomeClass::Exhausted, Vec::new(), None, started))
                }
            }
            Err(err) => {
                warn!(
                    worker_id = self.id,
                    job_id = job.id,
                    handle_id = handle.id(),
                    error = %err,
                    "extraction failed, retiring session"
                );
                self.ctx.pool.retire(handle);
                self.report.retired += 1;
                job.status = JobStatus::Failed;
                Some(self.outcome(&job, OutcomeClass::Error, Vec::new(), Some(err.to_string()), started))
            }
        }
    }

    fn acquire(&self, rt: &tokio::runtime::Runtime) -> Acquired<F::Session> {
        let settings = self.ctx.settings;
        let mut busy_attempts = 0u32;
        let mut create_failures = 0u32;
        loop {
            if self.ctx.shutdown.is_stopped() {
                return Acquired::Halted("stopped before dispatch");
            }
            let delay = match self.ctx.pool.acquire(settings.acquire_timeout) {
                Ok(handle) => return Acquired::Handle(handle),
                Err(PoolError::Shutdown) => return Acquired::Halted("session pool shut down"),
                Err(PoolError::Busy) => {
                    let delay = settings.backoff(busy_attempts);
                    busy_attempts = busy_attempts.saturating_add(1);
                    debug!(
                        worker_id = self.id,
                        attempt = busy_attempts,
                        ?delay,
                        error = %EngineError::HandleAcquisitionTimeout(settings.acquire_timeout),
                        "pool busy, backing off"
                    );
                    delay
                }
                Err(PoolError::Create(reason)) => {
                    create_failures += 1;
                    if create_failures > settings.create_retries {
                        error!(worker_id = self.id, error = %reason, "giving up on session creation");
                        return Acquired::GaveUp(PoolError::Create(reason).to_string());
                    }
                    settings.backoff(create_failures - 1)
                }
            };
            let token = self.ctx.shutdown.token();
            rt.block_on(async {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = token.cancelled() => {}
                }
            });
        }
    }

    /// Return an unattempted job to the scheduler and stop pulling work.
    /// No outcome is emitted, so the job stays below the resume watermark.
    fn hand_back(&mut self, job: Job, reason: &'static str) {
        info!(worker_id = self.id, job_id = job.id, reason, "job returned unattempted");
        self.ctx.scheduler.return_undispatched(job);
        self.report.returned += 1;
        self.halted = true;
    }

    fn outcome(
        &self,
        job: &Job,
        class: OutcomeClass,
        records: Vec<R>,
        error: Option<String>,
        started: Instant,
    ) -> JobOutcome<R> {
        JobOutcome {
            job_id: job.id,
            index: job.index,
            final_input: job.current_input().to_owned(),
            retry_depth: job.retry_depth(),
            class,
            records,
            error,
            worker_id: self.id,
            elapsed: started.elapsed(),
        }
    }
}

/// Spawn `count` worker threads sharing `ctx`.
///
/// # Errors
///
/// Returns the OS error if any thread fails to spawn; threads already
/// started keep running and exit once the scheduler stops.
pub fn spawn_workers<F, X, R>(
    count: usize,
    ctx: &WorkerContext<F, X, R>,
) -> std::io::Result<Vec<JoinHandle<WorkerReport>>>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    let mut handles = Vec::with_capacity(count);
    for worker_id in 0..count {
        handles.push(spawn_worker(worker_id, ctx.clone())?);
    }
    info!(worker_count = count, "workers started");
    Ok(handles)
}

fn spawn_worker<F, X, R>(
    worker_id: usize,
    ctx: WorkerContext<F, X, R>,
) -> std::io::Result<JoinHandle<WorkerReport>>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    let stack_size = ctx.settings.stack_size;
    thread::Builder::new()
        .name(format!("harvest-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id, error = %e, "failed to create worker runtime");
                    return WorkerReport {
                        worker_id,
                        ..WorkerReport::default()
                    };
                }
            };
            Worker::new(worker_id, ctx).run(&rt)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DedupKey, ExtractError, PoolLimits, SchedulerLimits};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Hit {
        name: String,
    }

    impl Record for Hit {
        fn dedup_key(&self) -> DedupKey {
            DedupKey::from_parts([&self.name])
        }

        fn columns() -> &'static [&'static str] {
            &["name"]
        }
    }

    struct Factory {
        next: AtomicU64,
    }

    impl SessionFactory for Factory {
        type Session = u64;

        fn create(&self) -> Result<u64, String> {
            Ok(self.next.fetch_add(1, Ordering::SeqCst))
        }

        fn probe(&self, _session: &mut u64) -> bool {
            true
        }

        fn destroy(&self, _session: u64) {}
    }

    #[derive(Clone, Default)]
    struct Scripted {
        replies: Arc<Mutex<HashMap<String, &'static str>>>,
    }

    #[async_trait]
    impl Extractor<u64, Hit> for Scripted {
        async fn extract(&self, target: &str, _session: &mut u64) -> Result<ExtractionResult<Hit>, ExtractError> {
            match self.replies.lock().get(target).copied().unwrap_or("ok") {
                "retry" => Ok(ExtractionResult::EmptyRetryable),
                "none" => Ok(ExtractionResult::EmptyNoRetry),
                "boom" => Err(ExtractError::Transport("reset".into())),
                _ => Ok(ExtractionResult::Success(vec![Hit { name: target.to_owned() }])),
            }
        }
    }

    fn harness(replies: &[(&str, &'static str)]) -> (Worker<Factory, Scripted, Hit>, Arc<TaskScheduler>, Arc<ResourcePool<Factory>>) {
        let pool = Arc::new(
            ResourcePool::new(
                Arc::new(Factory { next: AtomicU64::new(0) }),
                PoolLimits { pool_size: 1, handle_lifetime: 100 },
            )
            .unwrap(),
        );
        let shutdown = Shutdown::new();
        let scheduler = Arc::new(TaskScheduler::new(SchedulerLimits::default(), shutdown.clone()));
        let extractor = Scripted::default();
        extractor
            .replies
            .lock()
            .extend(replies.iter().map(|(k, v)| ((*k).to_owned(), *v)));
        let (tx, _rx) = crossbeam_channel::unbounded();
        let ctx = WorkerContext {
            pool: Arc::clone(&pool),
            scheduler: Arc::clone(&scheduler),
            extractor,
            outcomes: tx,
            shutdown,
            settings: WorkerSettings::default(),
        };
        (Worker::new(0, ctx), scheduler, pool)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let s = WorkerSettings::default();
        assert_eq!(s.backoff(0), Duration::from_millis(50));
        assert_eq!(s.backoff(1), Duration::from_millis(100));
        assert_eq!(s.backoff(3), Duration::from_millis(400));
        assert_eq!(s.backoff(10), Duration::from_secs(2));
        assert_eq!(s.backoff(u32::MAX), Duration::from_secs(2));
    }

    #[test]
    fn test_retryable_escalates_without_outcome() {
        let rt = runtime();
        let (mut worker, scheduler, _pool) = harness(&[("primary", "retry")]);
        let job = Job::new(1, 0, vec!["primary".into(), "secondary".into()]).unwrap();

        assert!(worker.process(&rt, job).is_none());
        assert_eq!(scheduler.stats().retry_enqueued, 1);

        let retried = scheduler.try_next().unwrap();
        let outcome = worker.process(&rt, retried).unwrap();
        assert_eq!(outcome.class, OutcomeClass::Success);
        assert_eq!(outcome.final_input, "secondary");
        assert_eq!(outcome.retry_depth, 1);
    }

    #[test]
    fn test_last_input_retryable_is_exhausted() {
        let rt = runtime();
        let (mut worker, scheduler, _pool) = harness(&[("only", "retry")]);
        let job = Job::new(1, 0, vec!["only".into()]).unwrap();
        let outcome = worker.process(&rt, job).unwrap();
        assert_eq!(outcome.class, OutcomeClass::Exhausted);
        assert_eq!(scheduler.stats().retry_enqueued, 0);
    }

    #[test]
    fn test_no_match_is_terminal() {
        let rt = runtime();
        let (mut worker, scheduler, _pool) = harness(&[("a", "none")]);
        let job = Job::new(1, 0, vec!["a".into(), "b".into()]).unwrap();
        let outcome = worker.process(&rt, job).unwrap();
        assert_eq!(outcome.class, OutcomeClass::NoMatch);
        assert_eq!(scheduler.stats().retry_enqueued, 0);
    }

    #[test]
    fn test_error_retires_session() {
        let rt = runtime();
        let (mut worker, _scheduler, pool) = harness(&[("a", "boom")]);
        let job = Job::new(1, 0, vec!["a".into()]).unwrap();
        let outcome = worker.process(&rt, job).unwrap();
        assert_eq!(outcome.class, OutcomeClass::Error);
        assert!(outcome.error.unwrap().contains("reset"));
        let stats = pool.stats();
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(worker.report().retired, 1);
    }

    #[test]
    fn test_stop_before_dispatch_returns_job_without_outcome() {
        let rt = runtime();
        let (mut worker, scheduler, pool) = harness(&[]);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();
        worker.ctx.shutdown.stop();
        let job = Job::new(1, 0, vec!["a".into()]).unwrap();

        assert!(worker.process(&rt, job).is_none());
        assert_eq!(worker.report().returned, 1);
        assert_eq!(worker.report().attempts, 0);
        assert_eq!(scheduler.undispatched(), 1);
        assert_eq!(scheduler.stats().returned, 1);
        pool.release(held);
    }

    #[test]
    fn test_pool_shutdown_returns_job_and_ends_worker() {
        let rt = runtime();
        let (worker, scheduler, pool) = harness(&[]);
        pool.shutdown();
        scheduler.enqueue(Job::new(1, 0, vec!["a".into()]).unwrap(), Priority::Retry);

        let report = worker.run(&rt);
        assert_eq!(report.outcomes, 0);
        assert_eq!(report.returned, 1);
        assert_eq!(scheduler.undispatched(), 1);
    }
}
