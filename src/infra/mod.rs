//! Infrastructure adapters: output store, diagnostics logs, host metrics.

pub mod diagnostics;
pub mod host_metrics;
pub mod sink;

pub use diagnostics::{DiagnosticLog, FileDiagnosticLog, InMemoryDiagnosticLog, NullDiagnosticLog};
pub use host_metrics::SystemMetrics;
pub use sink::{
    dedupe_file, read_records, DedupeStats, OutputHeader, OutputRecord, ResultSink, SinkSettings,
    SinkStats, SinkSummary,
};
