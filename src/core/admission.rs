//! Host-load admission control with hysteresis.
//!
//! A sampler thread feeds [`HostMetrics`] into a pure transition function.
//! Pausing needs two metrics over their high-water marks (or memory over the
//! hard ceiling); resuming needs every metric under its low-water mark.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::scheduler::{FeedGate, STOP_POLL};
use crate::util::Shutdown;

/// Admission state. Starts `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    /// Feeder may pull new jobs.
    Running,
    /// Feeder blocks; dispatched jobs keep going.
    Paused,
}

/// One sample of host load, every field a percentage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    /// CPU utilisation.
    pub cpu: f64,
    /// Memory in use.
    pub mem: f64,
    /// 1-minute load average divided by core count, times 100.
    pub load: f64,
}

/// Per-metric thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// CPU percent.
    pub cpu: f64,
    /// Memory percent.
    pub mem: f64,
    /// Normalised load percent.
    pub load: f64,
}

/// High and low water marks plus the memory hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Pause thresholds.
    pub high: Thresholds,
    /// Resume thresholds.
    pub low: Thresholds,
    /// Memory percent that pauses on its own.
    pub mem_ceiling: f64,
}

impl Default for Watermarks {
    fn default() -> Self {
        Self {
            high: Thresholds {
                cpu: 85.0,
                mem: 85.0,
                load: 90.0,
            },
            low: Thresholds {
                cpu: 60.0,
                mem: 70.0,
                load: 70.0,
            },
            mem_ceiling: 95.0,
        }
    }
}

impl Watermarks {
    /// Each low mark must sit strictly below its high mark.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistent pair.
    pub fn validate(&self) -> Result<(), String> {
        let pairs = [
            ("cpu", self.low.cpu, self.high.cpu),
            ("mem", self.low.mem, self.high.mem),
            ("load", self.low.load, self.high.load),
        ];
        for (name, low, high) in pairs {
            if low >= high {
                return Err(format!("admission low-water {name} ({low}) must be below high-water ({high})"));
            }
        }
        if self.mem_ceiling < self.high.mem {
            return Err("admissionMemCeiling must be >= admissionHighWater.mem".into());
        }
        Ok(())
    }
}

/// Pure state transition for one sample.
#[must_use]
pub fn evaluate(current: AdmissionState, m: HostMetrics, w: &Watermarks) -> AdmissionState {
    match current {
        AdmissionState::Running => {
            let high = [m.cpu > w.high.cpu, m.mem > w.high.mem, m.load > w.high.load]
                .into_iter()
                .filter(|h| *h)
                .count();
            if high >= 2 || m.mem > w.mem_ceiling {
                AdmissionState::Paused
            } else {
                AdmissionState::Running
            }
        }
        AdmissionState::Paused => {
            if m.cpu < w.low.cpu && m.mem < w.low.mem && m.load < w.low.load {
                AdmissionState::Running
            } else {
                AdmissionState::Paused
            }
        }
    }
}

/// Source of host samples.
pub trait MetricsSource: Send {
    /// Take one sample.
    fn sample(&mut self) -> HostMetrics;
}

/// Replays a fixed list of samples, repeating the last one.
#[derive(Debug, Clone)]
pub struct ScriptedMetrics {
    samples: Vec<HostMetrics>,
    cursor: usize,
}

impl ScriptedMetrics {
    /// Build from a sequence of samples.
    #[must_use]
    pub fn new(samples: Vec<HostMetrics>) -> Self {
        Self { samples, cursor: 0 }
    }
}

impl MetricsSource for ScriptedMetrics {
    fn sample(&mut self) -> HostMetrics {
        let idx = self.cursor.min(self.samples.len().saturating_sub(1));
        self.cursor = self.cursor.saturating_add(1);
        self.samples.get(idx).copied().unwrap_or_default()
    }
}

/// Counters exposed by [`AdmissionController::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdmissionStats {
    /// Current state.
    pub paused: bool,
    /// Whether a forced pause is holding.
    pub forced: bool,
    /// Samples evaluated.
    pub samples: u64,
    /// Running to Paused transitions.
    pub pauses: u64,
    /// Paused to Running transitions.
    pub resumes: u64,
    /// Most recent sample.
    pub last: HostMetrics,
}

struct Gate {
    state: AdmissionState,
    forced: bool,
    last: HostMetrics,
}

/// Gate between the backlog and the Normal queue.
pub struct AdmissionController {
    watermarks: Watermarks,
    gate: Mutex<Gate>,
    resumed: Condvar,
    samples: AtomicU64,
    pauses: AtomicU64,
    resumes: AtomicU64,
}

impl AdmissionController {
    /// Create a controller in the `Running` state.
    #[must_use]
    pub fn new(watermarks: Watermarks) -> Self {
        Self {
            watermarks,
            gate: Mutex::new(Gate {
                state: AdmissionState::Running,
                forced: false,
                last: HostMetrics::default(),
            }),
            resumed: Condvar::new(),
            samples: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AdmissionState {
        self.gate.lock().state
    }

    /// Apply one sample. A forced pause ignores samples.
    pub fn observe(&self, metrics: HostMetrics) -> AdmissionState {
        self.samples.fetch_add(1, Ordering::Relaxed);
        let mut gate = self.gate.lock();
        gate.last = metrics;
        if gate.forced {
            return gate.state;
        }
        let next = evaluate(gate.state, metrics, &self.watermarks);
        if next != gate.state {
            gate.state = next;
            drop(gate);
            self.record_transition(next, &metrics);
        }
        next
    }

    /// Pause immediately and hold until [`Self::force_resume`].
    pub fn force_pause(&self) {
        let mut gate = self.gate.lock();
        gate.forced = true;
        if gate.state == AdmissionState::Running {
            gate.state = AdmissionState::Paused;
            let last = gate.last;
            drop(gate);
            self.record_transition(AdmissionState::Paused, &last);
        }
        info!("admission force-paused");
    }

    /// Resume immediately and release any forced hold.
    pub fn force_resume(&self) {
        let mut gate = self.gate.lock();
        gate.forced = false;
        if gate.state == AdmissionState::Paused {
            gate.state = AdmissionState::Running;
            let last = gate.last;
            drop(gate);
            self.record_transition(AdmissionState::Running, &last);
        }
        info!("admission force-resumed");
    }

    /// Block while paused. Returns `false` if `shutdown` fired first.
    pub fn wait_until_running(&self, shutdown: &Shutdown) -> bool {
        let mut gate = self.gate.lock();
        loop {
            if shutdown.is_stopped() {
                return false;
            }
            if gate.state == AdmissionState::Running {
                return true;
            }
            let _ = self.resumed.wait_for(&mut gate, STOP_POLL);
        }
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let gate = self.gate.lock();
        AdmissionStats {
            paused: gate.state == AdmissionState::Paused,
            forced: gate.forced,
            samples: self.samples.load(Ordering::Relaxed),
            pauses: self.pauses.load(Ordering::Relaxed),
            resumes: self.resumes.load(Ordering::Relaxed),
            last: gate.last,
        }
    }

    /// Sample `source` every `interval` until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread could not be spawned.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        mut source: Box<dyn MetricsSource>,
        interval: Duration,
        shutdown: Shutdown,
    ) -> std::io::Result<JoinHandle<()>> {
        let controller = Arc::clone(self);
        thread::Builder::new()
            .name("harvest-admission".into())
            .spawn(move || {
                debug!(?interval, "admission sampler started");
                while !shutdown.is_stopped() {
                    controller.observe(source.sample());
                    let deadline = Instant::now() + interval;
                    while !shutdown.is_stopped() {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        thread::sleep(remaining.min(STOP_POLL));
                    }
                }
                debug!("admission sampler stopped");
            })
    }

    fn record_transition(&self, next: AdmissionState, m: &HostMetrics) {
        match next {
            AdmissionState::Paused => {
                self.pauses.fetch_add(1, Ordering::Relaxed);
                warn!(cpu = m.cpu, mem = m.mem, load = m.load, "host overloaded, pausing intake");
            }
            AdmissionState::Running => {
                self.resumes.fetch_add(1, Ordering::Relaxed);
                self.resumed.notify_all();
                info!(cpu = m.cpu, mem = m.mem, load = m.load, "host recovered, resuming intake");
            }
        }
    }
}

impl FeedGate for AdmissionController {
    fn wait_for_admission(&self, shutdown: &Shutdown) -> bool {
        self.wait_until_running(shutdown)
    }
}
