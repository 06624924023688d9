//! Host metrics backed by `sysinfo`.

use sysinfo::System;

use crate::core::{HostMetrics, MetricsSource};

/// Samples CPU, memory, and load from the local machine.
pub struct SystemMetrics {
    sys: System,
    cores: f64,
}

impl SystemMetrics {
    /// Create a sampler. The first CPU reading is primed here so the first
    /// sample is not a meaningless zero.
    #[must_use]
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        #[allow(clippy::cast_precision_loss)]
        let cores = num_cpus::get().max(1) as f64;
        Self { sys, cores }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SystemMetrics {
    #[allow(clippy::cast_precision_loss)]
    fn sample(&mut self) -> HostMetrics {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let total = self.sys.total_memory();
        let mem = if total == 0 {
            0.0
        } else {
            self.sys.used_memory() as f64 / total as f64 * 100.0
        };
        let load = System::load_average().one / self.cores * 100.0;

        HostMetrics {
            cpu: f64::from(self.sys.global_cpu_usage()),
            mem,
            load,
        }
    }
}
