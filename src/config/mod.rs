//! Configuration models for the engine, presets, and environment overrides.

pub mod engine;

pub use engine::{turbo_worker_count, EngineConfig, Preset};
