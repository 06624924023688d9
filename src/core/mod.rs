//! Core engine: jobs, session pool, scheduler, workers, admission,
//! checkpoints, failure detection, and the batch runner.

pub mod admission;
pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod failure;
pub mod job;
pub mod resource_pool;
pub mod scheduler;
pub mod worker;

pub use admission::{
    evaluate, AdmissionController, AdmissionState, AdmissionStats, HostMetrics, MetricsSource,
    ScriptedMetrics, Thresholds, Watermarks,
};
pub use checkpoint::{CheckpointManager, ProgressRecord, ProgressTracker, SaveCadence};
pub use engine::{Batch, Engine, MetricsFactory, OutcomeCounts, RunSummary};
pub use error::{AppResult, CheckpointError, EngineError, ExtractError, PoolError, SinkError};
pub use extractor::{Extractor, SessionFactory};
pub use failure::{input_signature, DiagnosticReport, FailureAggregator, SignatureFn, SuspectedCause};
pub use job::{
    DedupKey, ExtractionResult, Job, JobId, JobOutcome, JobStatus, OutcomeClass, Priority, Record,
};
pub use resource_pool::{PoolLimits, PoolStats, PooledHandle, ResourcePool};
pub use scheduler::{FeedGate, OpenGate, SchedulerLimits, SchedulerStats, TaskScheduler};
pub use worker::{spawn_workers, Worker, WorkerContext, WorkerReport, WorkerSettings};
