//! Windowed failure detection.
//!
//! Outcomes are bucketed into fixed windows. A window that is entirely
//! failures, or where one input shape accounts for most of the window's
//! failures, produces a [`DiagnosticReport`]. Reports are advisory and never
//! stop the run.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::core::{EngineError, JobOutcome};
use crate::infra::DiagnosticLog;
use crate::util::now_ms;

/// Share of a window one signature must fail for an input-format report (80%).
const SIGNATURE_NUM: usize = 4;
const SIGNATURE_DEN: usize = 5;

/// Maps an input string to its shape.
pub type SignatureFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Shape of an input: digit runs become `9`, letter runs become `a`, every
/// other character is kept.
///
/// `3-chōme-5-23+Ikejiri` becomes `9-a-9-9+a`.
#[must_use]
pub fn input_signature(input: &str) -> String {
    #[derive(PartialEq, Clone, Copy)]
    enum Run {
        Digit,
        Alpha,
        Other,
    }

    let mut out = String::with_capacity(input.len());
    let mut prev = Run::Other;
    for c in input.trim().chars() {
        let run = if c.is_numeric() {
            Run::Digit
        } else if c.is_alphabetic() {
            Run::Alpha
        } else {
            Run::Other
        };
        match run {
            Run::Digit if prev != Run::Digit => out.push('9'),
            Run::Alpha if prev != Run::Alpha => out.push('a'),
            Run::Other => out.push(c),
            _ => {}
        }
        prev = run;
    }
    out
}

/// What a report blames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuspectedCause {
    /// Everything failed with no dominant input shape.
    BadInputBatch,
    /// One input shape dominates the failures.
    InputFormat {
        /// Offending shape.
        signature: String,
    },
}

impl fmt::Display for SuspectedCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadInputBatch => f.write_str("bad input batch"),
            Self::InputFormat { signature } => write!(f, "input format `{signature}`"),
        }
    }
}

/// One systemic-failure finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticReport {
    /// Engine run that produced the report.
    pub run_id: String,
    /// Batch being processed.
    pub batch_id: String,
    /// Zero-based window number within the run.
    pub window_index: u64,
    /// Outcomes in the window (short for a trailing window).
    pub window_len: usize,
    /// Failed outcomes in the window.
    pub failures: usize,
    /// Suspected cause.
    pub cause: SuspectedCause,
    /// A few failing inputs, for a human to look at.
    pub sample_inputs: Vec<String>,
    /// Milliseconds since the epoch.
    pub created_at_ms: u64,
}

impl DiagnosticReport {
    /// Taxonomy entry for this report.
    #[must_use]
    pub fn as_error(&self) -> EngineError {
        EngineError::SystemicFailureDetected(format!(
            "{} ({}/{} failed in window {})",
            self.cause, self.failures, self.window_len, self.window_index
        ))
    }
}

const SAMPLE_INPUTS: usize = 5;

/// Watches outcomes window by window.
pub struct FailureAggregator {
    run_id: String,
    batch_id: String,
    window_size: usize,
    signature: SignatureFn,
    log: Box<dyn DiagnosticLog>,
    /// `(success, final input)` for the current window.
    window: Vec<(bool, String)>,
    windows_closed: u64,
    reports: u64,
}

impl FailureAggregator {
    /// Aggregator using [`input_signature`].
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        batch_id: impl Into<String>,
        window_size: usize,
        log: Box<dyn DiagnosticLog>,
    ) -> Self {
        let window_size = window_size.max(1);
        Self {
            run_id: run_id.into(),
            batch_id: batch_id.into(),
            window_size,
            signature: Arc::new(input_signature),
            log,
            window: Vec::with_capacity(window_size),
            windows_closed: 0,
            reports: 0,
        }
    }

    /// Replace the signature function.
    #[must_use]
    pub fn with_signature(mut self, signature: SignatureFn) -> Self {
        self.signature = signature;
        self
    }

    /// Point subsequent reports at another batch, clearing any partial window.
    pub fn start_batch(&mut self, batch_id: impl Into<String>) {
        self.batch_id = batch_id.into();
        self.window.clear();
    }

    /// Reports raised so far.
    #[must_use]
    pub const fn reports_raised(&self) -> u64 {
        self.reports
    }

    /// Feed one outcome. Returns a report if this outcome closed a
    /// pathological window.
    pub fn observe<R>(&mut self, outcome: &JobOutcome<R>) -> Option<DiagnosticReport> {
        self.window
            .push((outcome.class.is_success(), outcome.final_input.clone()));
        if self.window.len() < self.window_size {
            return None;
        }
        self.close_window()
    }

    /// Evaluate whatever is left in a partial window.
    pub fn finish(&mut self) -> Option<DiagnosticReport> {
        if self.window.is_empty() {
            return None;
        }
        self.close_window()
    }

    fn close_window(&mut self) -> Option<DiagnosticReport> {
        let window = std::mem::take(&mut self.window);
        let index = self.windows_closed;
        self.windows_closed += 1;

        let report = self.evaluate(index, &window)?;
        self.reports += 1;
        let err = report.as_error();
        warn!(
            batch_id = %report.batch_id,
            window = report.window_index,
            failures = report.failures,
            window_len = report.window_len,
            cause = %report.cause,
            "{err}"
        );
        if let Err(e) = self.log.record(&report) {
            error!(error = %e, "failed to persist diagnostic report");
        }
        Some(report)
    }

    fn evaluate(&self, index: u64, window: &[(bool, String)]) -> Option<DiagnosticReport> {
        let failed: Vec<&str> = window
            .iter()
            .filter(|(ok, _)| !ok)
            .map(|(_, input)| input.as_str())
            .collect();
        if failed.is_empty() {
            return None;
        }

        let mut by_signature: HashMap<String, usize> = HashMap::new();
        for input in &failed {
            *by_signature.entry((self.signature)(input)).or_default() += 1;
        }
        let dominant = by_signature
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .filter(|(_, count)| count * SIGNATURE_DEN >= window.len() * SIGNATURE_NUM);

        let cause = match dominant {
            Some((signature, _)) => SuspectedCause::InputFormat { signature },
            None if failed.len() == window.len() => SuspectedCause::BadInputBatch,
            None => return None,
        };

        Some(DiagnosticReport {
            run_id: self.run_id.clone(),
            batch_id: self.batch_id.clone(),
            window_index: index,
            window_len: window.len(),
            failures: failed.len(),
            cause,
            sample_inputs: failed.iter().take(SAMPLE_INPUTS).map(|s| (*s).to_owned()).collect(),
            created_at_ms: u64::try_from(now_ms()).unwrap_or(u64::MAX),
        })
    }
}
