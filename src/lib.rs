//! # Prometheus Harvest
//!
//! A resumable, admission-controlled batch extraction engine.
//!
//! The engine runs a large batch of independent "fetch one target, extract
//! structured records" jobs against a slow, flaky render target using a small
//! pool of expensive, stateful sessions (think headless browsers).
//!
//! ## Core Problem Solved
//!
//! - **Expensive sessions**: a bounded [`core::ResourcePool`] probes, reuses,
//!   and retires sessions so at most `poolSize` ever exist
//! - **Flaky inputs**: each job carries a ladder of alternative inputs; an
//!   empty-but-retryable result escalates the job onto a priority Retry queue
//! - **Restarts**: progress is checkpointed atomically as a contiguous
//!   watermark, so a restarted run skips everything already done
//! - **Overloaded hosts**: the [`core::AdmissionController`] pauses intake when
//!   CPU, memory, and load run hot, with hysteresis so it never flaps
//! - **Duplicate output**: the [`infra::ResultSink`] drops records whose
//!   natural key it has already written, across retries and resumes
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_harvest::builders::EngineBuilder;
//! use prometheus_harvest::config::{EngineConfig, Preset};
//! use prometheus_harvest::core::{AppResult, Batch};
//!
//! fn main() -> AppResult<()> {
//!     let config = EngineConfig::preset(Preset::Turbo)
//!         .with_env_overrides()
//!         .map_err(anyhow::Error::msg)?;
//!     config.init_tracing();
//!
//!     let mut engine = EngineBuilder::new(config, ChromeFactory::new(), PlacePage)
//!         .build::<Poi>()?;
//!
//!     // Ctrl-C handler: graceful stop keeps the final checkpoint.
//!     let stop = engine.shutdown_handle();
//!
//!     let batch = Batch::from_ladders("tokyo-2024", ladders)?;
//!     let summary = engine.run_batch(batch)?;
//!     println!("{} ok, {} failed", summary.outcomes.success, summary.outcomes.failures());
//!     Ok(())
//! }
//! ```
//!
//! The collaborator is two traits: [`core::SessionFactory`] for session
//! lifecycle and [`core::Extractor`] for the per-target call.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core engine: jobs, pool, scheduler, workers, admission, checkpoints.
pub mod core;
/// Configuration models, presets, and environment overrides.
pub mod config;
/// Builders to construct the engine from configuration.
pub mod builders;
/// Infrastructure adapters: output store, diagnostics, host metrics.
pub mod infra;
/// Shared utilities.
pub mod util;
