//! Error types for engine operations.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by engine components.
///
/// Apart from [`EngineError::NoHandles`], every variant is component-local:
/// it is logged and converted into an outcome or counter, never propagated
/// out of a running batch.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pool stayed exhausted for the whole acquire timeout.
    #[error("no render session became available within {0:?}")]
    HandleAcquisitionTimeout(Duration),
    /// A session misbehaved mid-job and was retired.
    #[error("render session corrupted: {0}")]
    HandleCorruption(String),
    /// The collaborator reported a terminal non-match.
    #[error("extraction found nothing and must not be retried")]
    ExtractionTerminal,
    /// The collaborator asked for the next input in the ladder.
    #[error("extraction found nothing; next input may succeed")]
    ExtractionRetryable,
    /// Checkpoint or output write failed; in-memory state is kept.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    /// A window of outcomes looks systemically broken. Advisory only.
    #[error("systemic failure detected: {0}")]
    SystemicFailureDetected(String),
    /// Not a single session could be created at startup; the batch is aborted.
    #[error("unable to create any render session: {0}")]
    NoHandles(String),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The batch itself is malformed (e.g. a job without inputs).
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    /// An engine thread could not be started.
    #[error("failed to spawn {0} thread: {1}")]
    ThreadSpawn(&'static str, String),
}

/// Errors returned by the resource pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Capacity exhausted for the whole wait; retry with backoff.
    #[error("pool busy")]
    Busy,
    /// The pool has been shut down.
    #[error("pool has been shut down")]
    Shutdown,
    /// The session factory failed to create a session.
    #[error("session creation failed: {0}")]
    Create(String),
}

/// Errors a collaborator may return from an extraction call.
///
/// Any error is treated as a handle/transport fault: the session is retired
/// and the job is reported with an error outcome.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Navigation or network failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The session is in an unusable state.
    #[error("session corrupted: {0}")]
    Corrupted(String),
    /// The render target did not answer in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors from checkpoint persistence.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Filesystem failure.
    #[error("checkpoint io error at {path}: {source}")]
    Io {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File exists but could not be decoded.
    #[error("checkpoint decode error at {path}: {source}")]
    Decode {
        /// File involved.
        path: String,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the result sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Filesystem failure.
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record (de)serialisation failure.
    #[error("sink encode error: {0}")]
    Encode(#[from] serde_json::Error),
    /// The sink thread has already exited.
    #[error("sink closed")]
    Closed,
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<SinkError> for EngineError {
    fn from(err: SinkError) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
