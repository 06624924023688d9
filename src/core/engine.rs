//! Batch runner wiring every component together.
//!
//! Per batch: load the checkpoint, seed the scheduler with the remaining
//! jobs, start the feeder, sampler, and workers, then collect outcomes on the
//! calling thread until every dispatched job has reported or the run stops.
//! The collector is the only checkpoint writer.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::core::scheduler::STOP_POLL;
use crate::core::worker::{spawn_workers, WorkerContext, WorkerReport};
use crate::core::{
    AdmissionController, AdmissionStats, CheckpointManager, DedupKey, DiagnosticReport, EngineError,
    Extractor, FailureAggregator, FeedGate, Job, JobOutcome, MetricsSource, OutcomeClass, PoolStats,
    ProgressRecord, ProgressTracker, Record, ResourcePool, SaveCadence, SchedulerStats, SessionFactory,
    TaskScheduler,
};
use crate::infra::{dedupe_file, DedupeStats, OutputRecord, ResultSink, SinkStats};
use crate::util::Shutdown;

/// Produces a fresh metrics source for each batch's sampler.
pub type MetricsFactory = Box<dyn Fn() -> Box<dyn MetricsSource> + Send + Sync>;

/// A named list of jobs.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Identifier used for the checkpoint and output file names.
    pub id: String,
    /// Jobs in batch order.
    pub jobs: Vec<Job>,
}

impl Batch {
    /// Build a batch from input ladders, one per job, in order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidBatch`] if the id is blank or any ladder
    /// is empty.
    pub fn from_ladders<I>(id: impl Into<String>, ladders: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(EngineError::InvalidBatch("batch id is empty".into()));
        }
        let jobs = ladders
            .into_iter()
            .enumerate()
            .map(|(index, inputs)| {
                Job::new(index as u64 + 1, index, inputs)
                    .ok_or_else(|| EngineError::InvalidBatch(format!("job at position {} has no inputs", index + 1)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { id, jobs })
    }

    /// Number of jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the batch has no jobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Outcome counts by class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Records extracted.
    pub success: u64,
    /// Terminal no-match.
    pub no_match: u64,
    /// Ladder ran out.
    pub exhausted: u64,
    /// Session or transport errors.
    pub error: u64,
}

impl OutcomeCounts {
    fn add(&mut self, class: OutcomeClass) {
        match class {
            OutcomeClass::Success => self.success += 1,
            OutcomeClass::NoMatch => self.no_match += 1,
            OutcomeClass::Exhausted => self.exhausted += 1,
            OutcomeClass::Error => self.error += 1,
        }
    }

    /// All non-success outcomes.
    #[must_use]
    pub const fn failures(&self) -> u64 {
        self.no_match + self.exhausted + self.error
    }

    /// All outcomes.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.success + self.failures()
    }
}

/// What a batch run reports back.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Unique id of this run.
    pub run_id: String,
    /// Batch processed.
    pub batch_id: String,
    /// Jobs in the batch.
    pub total_jobs: u64,
    /// Offset the run resumed from (0 for a fresh start).
    pub resumed_from: u64,
    /// Jobs seeded into the scheduler this run.
    pub dispatched: u64,
    /// Outcomes received this run, by class.
    pub outcomes: OutcomeCounts,
    /// Progress at the end of the run (counts include resumed work).
    pub progress: ProgressRecord,
    /// Output store.
    pub output_location: PathBuf,
    /// Checkpoint left on disk, `None` once the batch completed and it was cleared.
    pub final_checkpoint: Option<ProgressRecord>,
    /// Jobs never attempted this run; they sit above the saved watermark.
    pub undispatched: u64,
    /// Every job has an outcome.
    pub completed: bool,
    /// A stop was requested before the batch finished.
    pub stopped: bool,
    /// The stop was a hard interrupt (final checkpoint skipped).
    pub interrupted: bool,
    /// Systemic-failure reports raised.
    pub reports: Vec<DiagnosticReport>,
    /// Sink counters.
    pub sink: SinkStats,
    /// Result of the end-of-batch dedupe pass, if it ran.
    pub dedupe: Option<DedupeStats>,
    /// Pool counters.
    pub pool: PoolStats,
    /// Scheduler counters.
    pub scheduler: SchedulerStats,
    /// Admission counters.
    pub admission: AdmissionStats,
    /// Per-worker counters.
    pub workers: Vec<WorkerReport>,
    /// Wall time.
    pub elapsed: Duration,
}

/// Runs batches through a shared pool of render sessions.
pub struct Engine<F, X, R>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    config: EngineConfig,
    pool: Arc<ResourcePool<F>>,
    extractor: X,
    checkpoints: CheckpointManager,
    admission: Arc<AdmissionController>,
    aggregator: FailureAggregator,
    metrics: MetricsFactory,
    shutdown: Shutdown,
    seen_keys: HashSet<DedupKey>,
    _record: std::marker::PhantomData<fn() -> R>,
}

impl<F, X, R> Engine<F, X, R>
where
    F: SessionFactory,
    X: Extractor<F::Session, R>,
    R: Record,
{
    /// Assemble an engine from already-built parts. Prefer
    /// [`crate::builders::EngineBuilder`].
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn from_parts(
        config: EngineConfig,
        pool: Arc<ResourcePool<F>>,
        extractor: X,
        checkpoints: CheckpointManager,
        admission: Arc<AdmissionController>,
        aggregator: FailureAggregator,
        metrics: MetricsFactory,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            pool,
            extractor,
            checkpoints,
            admission,
            aggregator,
            metrics,
            shutdown,
            seen_keys: HashSet::new(),
            _record: std::marker::PhantomData,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Stop signal; clone it to stop or interrupt from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Admission controller, for `force_pause` / `force_resume`.
    #[must_use]
    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    /// Session pool.
    #[must_use]
    pub fn pool(&self) -> Arc<ResourcePool<F>> {
        Arc::clone(&self.pool)
    }

    /// Checkpoint store.
    #[must_use]
    pub const fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// Unfinished batches on disk.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceFailure`] if the directory cannot be listed.
    pub fn pending_batches(&self) -> Result<Vec<ProgressRecord>, EngineError> {
        Ok(self.checkpoints.list_pending()?)
    }

    /// Remove every checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PersistenceFailure`] on the first failed removal.
    pub fn clear_checkpoints(&self) -> Result<usize, EngineError> {
        Ok(self.checkpoints.clear_all()?)
    }

    /// Run batches in order, stopping early if the run is stopped.
    ///
    /// # Errors
    ///
    /// Returns the first engine-fatal error; summaries of batches finished
    /// before it are logged.
    pub fn run_batches<I>(&mut self, batches: I) -> Result<Vec<RunSummary>, EngineError>
    where
        I: IntoIterator<Item = Batch>,
    {
        let mut summaries = Vec::new();
        for batch in batches {
            if self.shutdown.is_stopped() {
                info!(batch_id = %batch.id, "run stopped, skipping remaining batches");
                break;
            }
            summaries.push(self.run_batch(batch)?);
        }
        Ok(summaries)
    }

    /// Run one batch to completion or until stopped.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoHandles`] if no session can be created,
    /// [`EngineError::PersistenceFailure`] if the output or checkpoint store
    /// cannot be opened, and [`EngineError::ThreadSpawn`] if an engine thread
    /// fails to start. Everything else is reported in the summary.
    #[allow(clippy::too_many_lines)]
    pub fn run_batch(&mut self, batch: Batch) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let total = batch.len() as u64;
        let Batch { id: batch_id, jobs } = batch;

        let progress = match self.checkpoints.load(&batch_id)? {
            Some(record) if record.total_jobs != total => {
                warn!(
                    batch_id = %batch_id,
                    stored = record.total_jobs,
                    actual = total,
                    "checkpoint job count does not match batch, starting over"
                );
                None
            }
            other => other,
        };

        if let Some(record) = progress.as_ref().filter(|r| r.is_complete()) {
            info!(batch_id = %batch_id, "batch already complete, clearing checkpoint");
            self.checkpoints.clear(&batch_id)?;
            return Ok(self.empty_summary(run_id, record.clone(), started));
        }

        let resumed_from = progress.as_ref().map_or(0, |r| r.last_completed_offset);
        let output_location = progress
            .as_ref()
            .map_or_else(|| self.config.output_path(&batch_id), |r| PathBuf::from(&r.output_location));
        let record = progress.unwrap_or_else(|| {
            ProgressRecord::new(batch_id.clone(), total, output_location.display().to_string())
        });
        let mut tracker = ProgressTracker::new(record);

        let remaining: Vec<Job> = jobs.into_iter().filter(|j| j.position() > resumed_from).collect();
        let dispatched = remaining.len() as u64;
        info!(
            run_id = %run_id,
            batch_id = %batch_id,
            total,
            resumed_from,
            dispatched,
            "batch starting"
        );

        let sink = ResultSink::<R>::open_seeded(
            &output_location,
            &batch_id,
            self.config.sink_settings(),
            self.seen_keys.clone(),
        )?;

        let want = self.config.warm_up.max(1).saturating_sub(self.pool.stats().live);
        if want > 0 {
            if let Err(e) = self.pool.warm_up(want) {
                error!(batch_id = %batch_id, error = %e, "no render session could be created, aborting batch");
                let _ = sink.close();
                return Err(e);
            }
        }

        self.aggregator.start_batch(batch_id.clone());
        let batch_signal = self.shutdown.child();
        let scheduler = Arc::new(TaskScheduler::new(self.config.scheduler_limits(), batch_signal.clone()));
        scheduler.extend(remaining);

        let mut threads = BatchThreads::default();
        let spawned = self.spawn_threads(&scheduler, &batch_signal, &mut threads);
        let (outcomes_rx, worker_handles) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                batch_signal.stop();
                scheduler.stop();
                threads.join();
                let _ = sink.close();
                return Err(e);
            }
        };
        threads.workers = worker_handles;

        let mut cadence = SaveCadence::new(self.config.checkpoint_period(), self.config.checkpoint_every);
        let mut counts = OutcomeCounts::default();
        let mut reports = Vec::new();
        let mut received = 0u64;

        while received < dispatched {
            let outcome = match outcomes_rx.recv_timeout(STOP_POLL) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    if cadence.is_due() {
                        self.save_checkpoint(&tracker, &sink, &mut cadence);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            received += 1;
            counts.add(outcome.class);
            if let Some(report) = self.collect(outcome, &mut tracker, &sink) {
                reports.push(report);
            }
            if cadence.tick() {
                self.save_checkpoint(&tracker, &sink, &mut cadence);
            }
        }

        batch_signal.stop();
        scheduler.stop();
        let workers = threads.join();
        // Outcomes sent between the last recv and the workers exiting.
        while let Ok(outcome) = outcomes_rx.try_recv() {
            counts.add(outcome.class);
            if let Some(report) = self.collect(outcome, &mut tracker, &sink) {
                reports.push(report);
            }
        }
        if let Some(report) = self.aggregator.finish() {
            reports.push(report);
        }

        let stopped = self.shutdown.is_stopped();
        let interrupted = self.shutdown.is_interrupted();
        let undispatched = scheduler.undispatched() as u64;
        if undispatched > 0 {
            info!(batch_id = %batch_id, undispatched, "jobs left for the next run");
        }

        let sink_summary = sink.close();
        let (sink_stats, persisted) = match sink_summary {
            Ok(summary) => {
                let persisted = summary.unwritten == 0;
                self.seen_keys.extend(summary.keys);
                (summary.stats, persisted)
            }
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "result sink failed to close");
                (SinkStats::default(), false)
            }
        };

        let completed = tracker.is_complete();
        let mut dedupe = None;
        let final_checkpoint = if interrupted {
            warn!(batch_id = %batch_id, "hard interrupt, final checkpoint skipped");
            self.checkpoints.load(&batch_id).ok().flatten()
        } else if !persisted {
            warn!(batch_id = %batch_id, "output not fully written, keeping last checkpoint");
            self.checkpoints.load(&batch_id).ok().flatten()
        } else if completed {
            if self.config.final_dedupe {
                match dedupe_file::<R>(&output_location) {
                    Ok(stats) => dedupe = Some(stats),
                    Err(e) => warn!(error = %e, "final dedupe pass failed"),
                }
            }
            if let Err(e) = self.checkpoints.clear(&batch_id) {
                warn!(error = %e, "could not clear checkpoint");
            }
            None
        } else {
            let snapshot = tracker.snapshot();
            match self.checkpoints.save(&snapshot) {
                Ok(()) => Some(snapshot),
                Err(e) => {
                    error!(error = %e, "final checkpoint failed");
                    self.checkpoints.load(&batch_id).ok().flatten()
                }
            }
        };

        let summary = RunSummary {
            run_id,
            batch_id,
            total_jobs: total,
            resumed_from,
            dispatched,
            outcomes: counts,
            progress: tracker.snapshot(),
            output_location,
            final_checkpoint,
            undispatched,
            completed,
            stopped,
            interrupted,
            reports,
            sink: sink_stats,
            dedupe,
            pool: self.pool.stats(),
            scheduler: scheduler.stats(),
            admission: self.admission.stats(),
            workers,
            elapsed: started.elapsed(),
        };
        info!(
            run_id = %summary.run_id,
            batch_id = %summary.batch_id,
            success = summary.outcomes.success,
            failed = summary.outcomes.failures(),
            completed,
            stopped,
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "batch finished"
        );
        Ok(summary)
    }

    #[allow(clippy::type_complexity)]
    fn spawn_threads(
        &self,
        scheduler: &Arc<TaskScheduler>,
        signal: &Shutdown,
        threads: &mut BatchThreads,
    ) -> Result<
        (
            crossbeam_channel::Receiver<JobOutcome<R>>,
            Vec<JoinHandle<WorkerReport>>,
        ),
        EngineError,
    > {
        if self.config.admission_enabled {
            let source = (self.metrics)();
            threads.sampler = Some(
                self.admission
                    .spawn_sampler(source, self.config.admission_sample_period(), signal.clone())
                    .map_err(|e| EngineError::ThreadSpawn("admission", e.to_string()))?,
            );
        }

        let gate: Arc<dyn FeedGate> = self.admission.clone();
        threads.feeder = Some(
            scheduler
                .spawn_feeder(gate)
                .map_err(|e| EngineError::ThreadSpawn("feeder", e.to_string()))?,
        );

        let (tx, rx) = unbounded();
        let ctx = WorkerContext {
            pool: Arc::clone(&self.pool),
            scheduler: Arc::clone(scheduler),
            extractor: self.extractor.clone(),
            outcomes: tx,
            shutdown: signal.clone(),
            settings: self.config.worker_settings(),
        };
        let workers = spawn_workers(self.config.worker_count, &ctx)
            .map_err(|e| EngineError::ThreadSpawn("worker", e.to_string()))?;
        Ok((rx, workers))
    }

    /// Apply one outcome to progress, output, and failure tracking.
    fn collect(
        &mut self,
        outcome: JobOutcome<R>,
        tracker: &mut ProgressTracker,
        sink: &ResultSink<R>,
    ) -> Option<DiagnosticReport> {
        debug!(
            job_id = outcome.job_id,
            worker_id = outcome.worker_id,
            class = ?outcome.class,
            retry_depth = outcome.retry_depth,
            "outcome"
        );
        tracker.observe(outcome.position(), outcome.class.is_success());
        let report = self.aggregator.observe(&outcome);
        if let Some(err) = outcome.class.as_error(outcome.error.as_deref()) {
            debug!(job_id = outcome.job_id, error = %err, "job failed");
        }
        let JobOutcome {
            final_input,
            retry_depth,
            records,
            ..
        } = outcome;
        for record in records {
            sink.submit(OutputRecord::new(record, final_input.clone(), retry_depth));
        }
        report
    }

    /// Flush the sink, then persist progress. If the flush fails the
    /// checkpoint is not advanced past records that never reached disk.
    fn save_checkpoint(&self, tracker: &ProgressTracker, sink: &ResultSink<R>, cadence: &mut SaveCadence) {
        if let Err(e) = sink.flush() {
            warn!(error = %e, "sink flush failed, checkpoint deferred");
            return;
        }
        if let Err(e) = self.checkpoints.save(&tracker.snapshot()) {
            warn!(error = %e, "checkpoint save failed, keeping in-memory progress");
            return;
        }
        cadence.saved();
    }

    fn empty_summary(&self, run_id: String, record: ProgressRecord, started: Instant) -> RunSummary {
        RunSummary {
            run_id,
            batch_id: record.batch_id.clone(),
            total_jobs: record.total_jobs,
            resumed_from: record.last_completed_offset,
            dispatched: 0,
            outcomes: OutcomeCounts::default(),
            output_location: PathBuf::from(&record.output_location),
            progress: record,
            final_checkpoint: None,
            undispatched: 0,
            completed: true,
            stopped: false,
            interrupted: false,
            reports: Vec::new(),
            sink: SinkStats::default(),
            dedupe: None,
            pool: self.pool.stats(),
            scheduler: SchedulerStats::default(),
            admission: self.admission.stats(),
            workers: Vec::new(),
            elapsed: started.elapsed(),
        }
    }
}

#[derive(Default)]
struct BatchThreads {
    sampler: Option<JoinHandle<()>>,
    feeder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<WorkerReport>>,
}

impl BatchThreads {
    fn join(&mut self) -> Vec<WorkerReport> {
        let mut reports = Vec::with_capacity(self.workers.len());
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(report) => reports.push(report),
                Err(_) => error!("worker thread panicked"),
            }
        }
        for handle in [self.feeder.take(), self.sampler.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("engine thread panicked");
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_rejects_empty_ladder() {
        let err = Batch::from_ladders("b", vec![vec!["a".into()], Vec::new()]).unwrap_err();
        assert!(matches!(err, EngineError::InvalidBatch(msg) if msg.contains("position 2")));
        assert!(Batch::from_ladders(" ", Vec::<Vec<String>>::new()).is_err());
    }

    #[test]
    fn test_batch_positions_are_one_based() {
        let batch = Batch::from_ladders("b", (0..3).map(|i| vec![format!("t{i}")])).unwrap();
        let positions: Vec<u64> = batch.jobs.iter().map(Job::position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_outcome_counts() {
        let mut c = OutcomeCounts::default();
        for class in [OutcomeClass::Success, OutcomeClass::NoMatch, OutcomeClass::Exhausted, OutcomeClass::Error] {
            c.add(class);
        }
        assert_eq!(c.failures(), 3);
        assert_eq!(c.total(), 4);
    }
}
