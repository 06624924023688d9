//! Jobs, extraction results, and outcomes.

use std::fmt;
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::core::EngineError;

/// Unique job identifier within a batch.
pub type JobId = u64;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting in the backlog or a queue.
    Pending,
    /// Checked out by a worker.
    InFlight,
    /// Produced a successful outcome.
    Done,
    /// Produced a non-successful outcome.
    Failed,
}

/// Queue selector for [`crate::core::TaskScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Regular intake from the backlog.
    Normal,
    /// Ladder escalation; always dispatched first.
    Retry,
}

/// One unit of work: a ladder of candidate inputs for a single target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Identifier, stable across retries.
    pub id: JobId,
    /// Zero-based position in the batch.
    pub index: usize,
    inputs: Vec<String>,
    rung: usize,
    /// Current lifecycle state.
    pub status: JobStatus,
}

impl Job {
    /// Build a job from its ladder. Returns `None` if `inputs` is empty.
    #[must_use]
    pub fn new(id: JobId, index: usize, inputs: Vec<String>) -> Option<Self> {
        if inputs.is_empty() {
            return None;
        }
        Some(Self {
            id,
            index,
            inputs,
            rung: 0,
            status: JobStatus::Pending,
        })
    }

    /// The full ladder, in declared order.
    #[must_use]
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// The input to attempt next.
    #[must_use]
    pub fn current_input(&self) -> &str {
        &self.inputs[self.rung]
    }

    /// How many escalations this job has already gone through.
    #[must_use]
    pub const fn retry_depth(&self) -> usize {
        self.rung
    }

    /// Whether another input remains after the current one.
    #[must_use]
    pub fn has_next_input(&self) -> bool {
        self.rung + 1 < self.inputs.len()
    }

    /// Move to the next input. Returns `false` when the ladder is exhausted.
    pub fn escalate(&mut self) -> bool {
        if self.has_next_input() {
            self.rung += 1;
            self.status = JobStatus::Pending;
            true
        } else {
            false
        }
    }

    /// 1-based position used by checkpoint offsets.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.index as u64 + 1
    }
}

/// Natural identity of a record, used for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl DedupKey {
    /// Join identity fields into a key. Fields are separated by a unit separator
    /// so `("a|b", "c")` and `("a", "b|c")` never collide.
    #[must_use]
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = parts
            .into_iter()
            .map(|p| p.as_ref().trim().to_owned())
            .collect::<Vec<_>>()
            .join("\u{1f}");
        Self(joined)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A structured record produced by the collaborator.
///
/// The engine never looks inside a record beyond asking for its key and
/// serialising it to the output store.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Identity used to collapse duplicates across retries and batches.
    fn dedup_key(&self) -> DedupKey;

    /// Column names written into the output header.
    fn columns() -> &'static [&'static str];
}

/// Tri-state classification returned by the collaborator.
#[derive(Debug, Clone)]
pub enum ExtractionResult<R> {
    /// Records were found.
    Success(Vec<R>),
    /// Nothing found and no other input will help.
    EmptyNoRetry,
    /// Nothing found; the next input in the ladder may succeed.
    EmptyRetryable,
}

/// Final classification of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    /// Records extracted.
    Success,
    /// Collaborator said no match, terminal.
    NoMatch,
    /// Every input returned a retryable empty result.
    Exhausted,
    /// Handle or transport error, or session creation kept failing.
    Error,
}

impl OutcomeClass {
    /// Whether this counts towards the success total.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Error taxonomy entry this classification corresponds to.
    #[must_use]
    pub fn as_error(self, detail: Option<&str>) -> Option<EngineError> {
        match self {
            Self::Success => None,
            Self::NoMatch => Some(EngineError::ExtractionTerminal),
            Self::Exhausted => Some(EngineError::ExtractionRetryable),
            Self::Error => Some(EngineError::HandleCorruption(
                detail.unwrap_or("unknown").to_owned(),
            )),
        }
    }
}

/// Terminal result of one job. Exactly one is produced per job.
#[derive(Debug, Clone)]
pub struct JobOutcome<R> {
    /// Job identifier.
    pub job_id: JobId,
    /// Zero-based batch position.
    pub index: usize,
    /// Input that produced this outcome.
    pub final_input: String,
    /// Number of escalations before this outcome.
    pub retry_depth: usize,
    /// Classification.
    pub class: OutcomeClass,
    /// Extracted records (empty unless `class` is `Success`).
    pub records: Vec<R>,
    /// Error detail for failures.
    pub error: Option<String>,
    /// Worker that produced the outcome.
    pub worker_id: usize,
    /// Time spent on the final attempt.
    pub elapsed: Duration,
}

impl<R> JobOutcome<R> {
    /// 1-based position used by checkpoint offsets.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.index as u64 + 1
    }
}
