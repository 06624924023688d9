//! Engine configuration: sizing, admission watermarks, persistence cadence.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{PoolLimits, SchedulerLimits, Thresholds, Watermarks, WorkerSettings};
use crate::infra::SinkSettings;

/// Named starting points for [`EngineConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Two workers, balanced timeouts.
    Default,
    /// Four workers, short timeouts, small feed chunks.
    Fast,
    /// One worker, long timeouts, more creation retries.
    Stable,
    /// One worker with debug logging and tight failure windows.
    Debug,
    /// Sized from the core count for large batches.
    Turbo,
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "fast" => Ok(Self::Fast),
            "stable" => Ok(Self::Stable),
            "debug" => Ok(Self::Debug),
            "turbo" => Ok(Self::Turbo),
            other => Err(format!("unknown preset `{other}`")),
        }
    }
}

/// Worker count for a host with `cores` logical CPUs: ×4 capped at 48 on 12+
/// cores, ×3 capped at 36 on 8+, ×2 capped at 24 otherwise.
#[must_use]
pub fn turbo_worker_count(cores: usize) -> usize {
    let cores = cores.max(1);
    if cores >= 12 {
        (cores * 4).min(48)
    } else if cores >= 8 {
        (cores * 3).min(36)
    } else {
        (cores * 2).min(24)
    }
}

/// Full engine configuration. JSON keys are camelCase; missing keys take
/// the `default` preset's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Maximum live render sessions.
    pub pool_size: usize,
    /// Worker threads.
    pub worker_count: usize,
    /// Uses before a session is retired.
    pub handle_lifetime: u32,
    /// Pause thresholds.
    pub admission_high_water: Thresholds,
    /// Resume thresholds.
    pub admission_low_water: Thresholds,
    /// Memory percent that pauses on its own.
    pub admission_mem_ceiling: f64,
    /// Seconds between host samples.
    pub admission_sample_interval: f64,
    /// Run the host sampler at all.
    pub admission_enabled: bool,
    /// Seconds between checkpoint saves.
    pub checkpoint_interval: u64,
    /// Outcomes between checkpoint saves.
    pub checkpoint_every: u64,
    /// Records buffered before the sink writes.
    pub sink_flush_size: usize,
    /// Seconds a record may wait in the sink buffer.
    pub sink_flush_interval: u64,
    /// Outcomes per failure-detection window.
    pub failure_window_size: usize,
    /// Single pool wait before a worker backs off.
    pub acquire_timeout_ms: u64,
    /// Cap on one extraction call, in seconds.
    pub extract_timeout_secs: Option<u64>,
    /// Session-creation failures tolerated per job.
    pub create_retries: u32,
    /// Jobs moved from the backlog per feeder step.
    pub feed_chunk: usize,
    /// Normal-queue capacity; `workerCount * 8` when absent.
    pub normal_queue_capacity: Option<usize>,
    /// Sessions created before the first job.
    pub warm_up: usize,
    /// Directory for `<batchId>.jsonl` output files.
    pub output_dir: PathBuf,
    /// Directory for checkpoint files.
    pub checkpoint_dir: PathBuf,
    /// Directory for the diagnostics log.
    pub diagnostics_dir: PathBuf,
    /// Rewrite the output without duplicates once a batch completes.
    pub final_dedupe: bool,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            worker_count: 2,
            handle_lifetime: 40,
            admission_high_water: Watermarks::default().high,
            admission_low_water: Watermarks::default().low,
            admission_mem_ceiling: Watermarks::default().mem_ceiling,
            admission_sample_interval: 5.0,
            admission_enabled: true,
            checkpoint_interval: 120,
            checkpoint_every: 50,
            sink_flush_size: 25,
            sink_flush_interval: 8,
            failure_window_size: 50,
            acquire_timeout_ms: 2_000,
            extract_timeout_secs: Some(15),
            create_retries: 3,
            feed_chunk: 20,
            normal_queue_capacity: None,
            warm_up: 1,
            output_dir: PathBuf::from("data/output"),
            checkpoint_dir: PathBuf::from("data/progress"),
            diagnostics_dir: PathBuf::from("data/diagnostics"),
            final_dedupe: true,
            log_filter: "info".into(),
        }
    }
}

impl EngineConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a named preset.
    #[must_use]
    pub fn preset(preset: Preset) -> Self {
        let base = Self::default();
        match preset {
            Preset::Default => base,
            Preset::Fast => Self {
                pool_size: 4,
                worker_count: 4,
                feed_chunk: 10,
                extract_timeout_secs: Some(10),
                ..base
            },
            Preset::Stable => Self {
                pool_size: 1,
                worker_count: 1,
                feed_chunk: 50,
                extract_timeout_secs: Some(30),
                create_retries: 5,
                ..base
            },
            Preset::Debug => Self {
                pool_size: 1,
                worker_count: 1,
                failure_window_size: 10,
                checkpoint_every: 5,
                log_filter: "debug".into(),
                ..base
            },
            Preset::Turbo => {
                let workers = turbo_worker_count(num_cpus::get());
                Self {
                    pool_size: workers,
                    worker_count: workers,
                    handle_lifetime: 1_000,
                    feed_chunk: 10,
                    warm_up: workers.min(4),
                    ..base
                }
            }
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("poolSize must be greater than 0".into());
        }
        if self.handle_lifetime == 0 {
            return Err("handleLifetime must be greater than 0".into());
        }
        if self.worker_count == 0 {
            return Err("workerCount must be greater than 0".into());
        }
        if self.feed_chunk == 0 {
            return Err("feedChunk must be greater than 0".into());
        }
        if self.normal_queue_capacity == Some(0) {
            return Err("normalQueueCapacity must be greater than 0".into());
        }
        if self.sink_flush_size == 0 {
            return Err("sinkFlushSize must be greater than 0".into());
        }
        if self.failure_window_size == 0 {
            return Err("failureWindowSize must be greater than 0".into());
        }
        if self.checkpoint_every == 0 {
            return Err("checkpointEvery must be greater than 0".into());
        }
        if self.acquire_timeout_ms == 0 {
            return Err("acquireTimeoutMs must be greater than 0".into());
        }
        if !(self.admission_sample_interval.is_finite() && self.admission_sample_interval > 0.0) {
            return Err("admissionSampleInterval must be a positive number of seconds".into());
        }
        if self.warm_up > self.pool_size {
            return Err("warmUp must not exceed poolSize".into());
        }
        self.watermarks().validate()
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns a read, parse, or validation message.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
        Self::from_json_str(&body)
    }

    /// Merge a JSON object over this configuration. Top-level keys present
    /// in `body` replace the current values; absent keys keep them.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn overlay_json(self, body: &str) -> Result<Self, String> {
        let mut merged = serde_json::to_value(&self).map_err(|e| format!("serialize error: {e}"))?;
        let patch: serde_json::Value = serde_json::from_str(body).map_err(|e| format!("parse error: {e}"))?;
        let (Some(target), serde_json::Value::Object(fields)) = (merged.as_object_mut(), patch) else {
            return Err("configuration must be a JSON object".into());
        };
        target.extend(fields);
        let cfg: Self = serde_json::from_value(merged).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build the configuration in layers: the preset named by
    /// `HARVEST_PRESET` (or `default`), then `file` if given, then the other
    /// `HARVEST_*` overrides. `.env` is loaded first.
    ///
    /// # Errors
    ///
    /// Returns a read, parse, or validation message.
    pub fn load(file: Option<&Path>) -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::layered(file, |key| std::env::var(key).ok())
    }

    fn layered(file: Option<&Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut cfg = match var("HARVEST_PRESET") {
            Some(raw) => Self::preset(raw.parse()?),
            None => Self::default(),
        };
        if let Some(path) = file {
            let body = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            cfg = cfg.overlay_json(&body)?;
        }
        cfg.apply_overrides(var)
    }

    /// Apply `HARVEST_*` environment overrides, loading `.env` first.
    ///
    /// `HARVEST_PRESET` is not read here, since it would discard settings
    /// already applied to `self`; [`Self::load`] applies it as the base layer.
    ///
    /// Recognised: `HARVEST_POOL_SIZE`,
    /// `HARVEST_WORKER_COUNT`, `HARVEST_HANDLE_LIFETIME`,
    /// `HARVEST_CHECKPOINT_INTERVAL`, `HARVEST_SINK_FLUSH_SIZE`,
    /// `HARVEST_SINK_FLUSH_INTERVAL`, `HARVEST_FAILURE_WINDOW_SIZE`,
    /// `HARVEST_OUTPUT_DIR`, `HARVEST_CHECKPOINT_DIR`,
    /// `HARVEST_DIAGNOSTICS_DIR`, `HARVEST_ADMISSION_ENABLED`.
    ///
    /// # Errors
    ///
    /// Returns a message naming the variable that failed to parse, or the
    /// validation failure of the result.
    pub fn with_env_overrides(self) -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T, String>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim().parse().map_err(|e| format!("{key}: {e}"))
        }

        if let Some(raw) = var("HARVEST_POOL_SIZE") {
            self.pool_size = parse("HARVEST_POOL_SIZE", &raw)?;
        }
        if let Some(raw) = var("HARVEST_WORKER_COUNT") {
            self.worker_count = parse("HARVEST_WORKER_COUNT", &raw)?;
        }
        if let Some(raw) = var("HARVEST_HANDLE_LIFETIME") {
            self.handle_lifetime = parse("HARVEST_HANDLE_LIFETIME", &raw)?;
        }
        if let Some(raw) = var("HARVEST_CHECKPOINT_INTERVAL") {
            self.checkpoint_interval = parse("HARVEST_CHECKPOINT_INTERVAL", &raw)?;
        }
        if let Some(raw) = var("HARVEST_SINK_FLUSH_SIZE") {
            self.sink_flush_size = parse("HARVEST_SINK_FLUSH_SIZE", &raw)?;
        }
        if let Some(raw) = var("HARVEST_SINK_FLUSH_INTERVAL") {
            self.sink_flush_interval = parse("HARVEST_SINK_FLUSH_INTERVAL", &raw)?;
        }
        if let Some(raw) = var("HARVEST_FAILURE_WINDOW_SIZE") {
            self.failure_window_size = parse("HARVEST_FAILURE_WINDOW_SIZE", &raw)?;
        }
        if let Some(raw) = var("HARVEST_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("HARVEST_CHECKPOINT_DIR") {
            self.checkpoint_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("HARVEST_DIAGNOSTICS_DIR") {
            self.diagnostics_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("HARVEST_ADMISSION_ENABLED") {
            self.admission_enabled = parse("HARVEST_ADMISSION_ENABLED", &raw)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Set pool size.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set worker count.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set session lifetime.
    #[must_use]
    pub const fn with_handle_lifetime(mut self, handle_lifetime: u32) -> Self {
        self.handle_lifetime = handle_lifetime;
        self
    }

    /// Set checkpoint cadence.
    #[must_use]
    pub const fn with_checkpoint_cadence(mut self, interval_secs: u64, every: u64) -> Self {
        self.checkpoint_interval = interval_secs;
        self.checkpoint_every = every;
        self
    }

    /// Set sink flush thresholds.
    #[must_use]
    pub const fn with_sink_flush(mut self, size: usize, interval_secs: u64) -> Self {
        self.sink_flush_size = size;
        self.sink_flush_interval = interval_secs;
        self
    }

    /// Set failure window size.
    #[must_use]
    pub const fn with_failure_window_size(mut self, size: usize) -> Self {
        self.failure_window_size = size;
        self
    }

    /// Enable or disable the host sampler.
    #[must_use]
    pub const fn with_admission_enabled(mut self, enabled: bool) -> Self {
        self.admission_enabled = enabled;
        self
    }

    /// Set the extraction timeout.
    #[must_use]
    pub const fn with_extract_timeout(mut self, secs: Option<u64>) -> Self {
        self.extract_timeout_secs = secs;
        self
    }

    /// Set the single pool wait.
    #[must_use]
    pub const fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    /// Set warm-up count.
    #[must_use]
    pub const fn with_warm_up(mut self, count: usize) -> Self {
        self.warm_up = count;
        self
    }

    /// Toggle the end-of-batch dedupe pass.
    #[must_use]
    pub const fn with_final_dedupe(mut self, enabled: bool) -> Self {
        self.final_dedupe = enabled;
        self
    }

    /// Put output, checkpoints, and diagnostics under one root.
    #[must_use]
    pub fn with_data_dir(mut self, root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        self.output_dir = root.join("output");
        self.checkpoint_dir = root.join("progress");
        self.diagnostics_dir = root.join("diagnostics");
        self
    }

    /// Install the default tracing subscriber, falling back to
    /// [`Self::log_filter`] when `RUST_LOG` is unset.
    pub fn init_tracing(&self) {
        crate::util::init_tracing_with(&self.log_filter);
    }

    /// Pool sizing.
    #[must_use]
    pub const fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            pool_size: self.pool_size,
            handle_lifetime: self.handle_lifetime,
        }
    }

    /// Scheduler sizing.
    #[must_use]
    pub fn scheduler_limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            normal_capacity: self
                .normal_queue_capacity
                .unwrap_or_else(|| self.worker_count.saturating_mul(8)),
            feed_chunk: self.feed_chunk,
        }
    }

    /// Worker backoff and timeouts.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            extract_timeout: self.extract_timeout_secs.map(Duration::from_secs),
            create_retries: self.create_retries,
            ..WorkerSettings::default()
        }
    }

    /// Admission thresholds.
    #[must_use]
    pub const fn watermarks(&self) -> Watermarks {
        Watermarks {
            high: self.admission_high_water,
            low: self.admission_low_water,
            mem_ceiling: self.admission_mem_ceiling,
        }
    }

    /// Host sampling period.
    #[must_use]
    pub fn admission_sample_period(&self) -> Duration {
        Duration::from_secs_f64(self.admission_sample_interval)
    }

    /// Sink thresholds.
    #[must_use]
    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            flush_size: self.sink_flush_size,
            flush_interval: Duration::from_secs(self.sink_flush_interval),
            ..SinkSettings::default()
        }
    }

    /// Time between checkpoint saves.
    #[must_use]
    pub const fn checkpoint_period(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval)
    }

    /// Output file for `batch_id`.
    #[must_use]
    pub fn output_path(&self, batch_id: &str) -> PathBuf {
        let safe: String = batch_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        self.output_dir.join(format!("{safe}.jsonl"))
    }
}
