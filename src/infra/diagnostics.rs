//! Durable and in-memory diagnostic logs for failure reports.

use std::collections::VecDeque;
use std::fs::{create_dir_all, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{DiagnosticReport, SinkError};

/// Where failure reports are written.
pub trait DiagnosticLog: Send {
    /// Record one report.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the report could not be persisted.
    fn record(&mut self, report: &DiagnosticReport) -> Result<(), SinkError>;
}

/// Appends one JSON object per line to `<dir>/diagnostics.jsonl`.
pub struct FileDiagnosticLog {
    path: PathBuf,
}

impl FileDiagnosticLog {
    /// Open the log under `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Io`] if the directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref();
        create_dir_all(dir)?;
        Ok(Self {
            path: dir.join("diagnostics.jsonl"),
        })
    }

    /// File being appended to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticLog for FileDiagnosticLog {
    fn record(&mut self, report: &DiagnosticReport) -> Result<(), SinkError> {
        let line = serde_json::to_string(report)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

/// Bounded in-memory log; clones share the same buffer.
#[derive(Clone)]
pub struct InMemoryDiagnosticLog {
    reports: Arc<Mutex<VecDeque<DiagnosticReport>>>,
    max_reports: usize,
}

impl InMemoryDiagnosticLog {
    /// Keep at most `max_reports`, dropping the oldest.
    #[must_use]
    pub fn new(max_reports: usize) -> Self {
        Self {
            reports: Arc::new(Mutex::new(VecDeque::with_capacity(max_reports))),
            max_reports: max_reports.max(1),
        }
    }

    /// Snapshot of stored reports, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<DiagnosticReport> {
        self.reports.lock().iter().cloned().collect()
    }
}

impl DiagnosticLog for InMemoryDiagnosticLog {
    fn record(&mut self, report: &DiagnosticReport) -> Result<(), SinkError> {
        let mut reports = self.reports.lock();
        if reports.len() >= self.max_reports {
            reports.pop_front();
        }
        reports.push_back(report.clone());
        Ok(())
    }
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDiagnosticLog;

impl DiagnosticLog for NullDiagnosticLog {
    fn record(&mut self, _report: &DiagnosticReport) -> Result<(), SinkError> {
        Ok(())
    }
}
