//! Shared fakes for the integration tests: a session factory with fault
//! injection, a scripted extractor, and a small record type.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use prometheus_harvest::config::EngineConfig;
use prometheus_harvest::core::{
    Batch, DedupKey, ExtractError, ExtractionResult, Extractor, ProgressRecord, Record,
    SessionFactory,
};
use prometheus_harvest::util::Shutdown;

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poi {
    pub name: String,
    pub address: String,
}

impl Poi {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

impl Record for Poi {
    fn dedup_key(&self) -> DedupKey {
        DedupKey::from_parts([&self.name, &self.address])
    }

    fn columns() -> &'static [&'static str] {
        &["name", "address"]
    }
}

// ============================================================================
// SESSION FACTORY
// ============================================================================

#[derive(Debug)]
pub struct FakeSession {
    pub id: u64,
    pub uses: u32,
}

/// Counts lifecycle calls. Probe fails for `sick_session` once it has been
/// used `sick_after` times; `create` fails while `fail_create` is set.
#[derive(Default)]
pub struct FakeFactory {
    pub next_id: AtomicU64,
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub probes: AtomicU64,
    pub fail_create: AtomicBool,
    pub sick_session: Option<u64>,
    pub sick_after: u32,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sick_session(id: u64, after_uses: u32) -> Self {
        Self {
            sick_session: Some(id),
            sick_after: after_uses,
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        let factory = Self::default();
        factory.fail_create.store(true, Ordering::SeqCst);
        factory
    }
}

impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    fn create(&self) -> Result<FakeSession, String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err("browser failed to launch".into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(FakeSession { id, uses: 0 })
    }

    fn probe(&self, session: &mut FakeSession) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        !(self.sick_session == Some(session.id) && session.uses >= self.sick_after)
    }

    fn destroy(&self, _session: FakeSession) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// What the scripted extractor does for one target.
#[derive(Debug, Clone)]
pub enum Step {
    /// One record named after the target.
    Found,
    /// The given records.
    Records(Vec<Poi>),
    /// Terminal empty result.
    NoMatch,
    /// Empty, try the next input.
    Retryable,
    /// Transport failure.
    Fail,
    /// Request a graceful stop, then return one record.
    StopAfter,
    /// Request a hard interrupt, then return one record.
    InterruptAfter,
}

/// Callback run on the worker thread just before a given target's step.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Extractor driven by a target → step table. Unknown targets use `Found`.
#[derive(Clone)]
pub struct ScriptedExtractor {
    script: Arc<HashMap<String, Step>>,
    calls: Arc<Mutex<Vec<String>>>,
    shutdown: Option<Shutdown>,
    delay: Duration,
    hook: Option<(String, Hook)>,
}

impl ScriptedExtractor {
    pub fn new(script: HashMap<String, Step>) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
            shutdown: None,
            delay: Duration::ZERO,
            hook: None,
        }
    }

    pub fn found() -> Self {
        Self::new(HashMap::new())
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_hook(mut self, target: &str, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some((target.to_owned(), Arc::new(hook)));
        self
    }

    /// Targets seen so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn found_record(target: &str) -> Vec<Poi> {
        vec![Poi::new(target, "1 Main St")]
    }
}

#[async_trait]
impl Extractor<FakeSession, Poi> for ScriptedExtractor {
    async fn extract(
        &self,
        target: &str,
        session: &mut FakeSession,
    ) -> Result<ExtractionResult<Poi>, ExtractError> {
        session.uses += 1;
        self.calls.lock().push(target.to_owned());
        if let Some((on, hook)) = &self.hook {
            if on == target {
                hook();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.script.get(target).cloned().unwrap_or(Step::Found);
        Ok(match step {
            Step::Found => ExtractionResult::Success(Self::found_record(target)),
            Step::Records(records) => ExtractionResult::Success(records),
            Step::NoMatch => ExtractionResult::EmptyNoRetry,
            Step::Retryable => ExtractionResult::EmptyRetryable,
            Step::Fail => return Err(ExtractError::Transport(format!("{target} unreachable"))),
            Step::StopAfter => {
                if let Some(shutdown) = &self.shutdown {
                    shutdown.stop();
                }
                ExtractionResult::Success(Self::found_record(target))
            }
            Step::InterruptAfter => {
                if let Some(shutdown) = &self.shutdown {
                    shutdown.interrupt();
                }
                ExtractionResult::Success(Self::found_record(target))
            }
        })
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Config rooted in `dir` with admission off and short waits.
pub fn test_config(dir: &std::path::Path, workers: usize) -> EngineConfig {
    EngineConfig::default()
        .with_data_dir(dir)
        .with_worker_count(workers)
        .with_pool_size(workers)
        .with_warm_up(1)
        .with_admission_enabled(false)
        .with_acquire_timeout_ms(100)
        .with_extract_timeout(None)
}

/// Poll the checkpoint file at `path` until it records `offset`, then
/// return its exact bytes.
pub fn wait_for_checkpoint(path: &Path, offset: u64) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(bytes) = std::fs::read(path) {
            if let Ok(record) = serde_json::from_slice::<ProgressRecord>(&bytes) {
                if record.last_completed_offset == offset {
                    return bytes;
                }
            }
        }
        assert!(Instant::now() < deadline, "checkpoint never reached offset {offset}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Batch of `n` single-input jobs targeting `t-1` .. `t-n`.
pub fn simple_batch(id: &str, n: usize) -> Batch {
    Batch::from_ladders(id, (1..=n).map(|i| vec![format!("t-{i}")])).unwrap()
}
