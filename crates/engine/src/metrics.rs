use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobit_core::Diagnostic;
use serde::Serialize;

/// Outcome of one `run_jobs` dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    /// Distinct priority values dispatched.
    pub bands: usize,
    /// Jobs whose start succeeded.
    pub started: usize,
    /// Jobs that failed or panicked while starting.
    pub failed: Vec<Diagnostic>,
}

/// Invoker operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InvokerMetrics {
    /// Cycles dispatched.
    pub cycles: u64,
    /// Successful job starts across all cycles.
    pub jobs_started: u64,
    /// Failed starts by job name.
    pub job_failures: HashMap<String, u64>,
    /// Bands dispatched in the most recent cycle.
    pub last_cycle_bands: usize,
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Average time spent dispatching a cycle, not waiting on it.
    pub avg_dispatch_time: Duration,
}

impl InvokerMetrics {
    /// Record a dispatched cycle.
    pub fn record_cycle(&mut self, report: &CycleReport, dispatch_time: Duration) {
        self.cycles += 1;
        self.jobs_started += report.started as u64;
        self.last_cycle_bands = report.bands;
        self.last_cycle_at = Some(Utc::now());
        for failure in &report.failed {
            *self.job_failures.entry(failure.job().to_string()).or_default() += 1;
        }

        // Incremental mean: new_avg = prev_avg + (sample - prev_avg) / count
        self.avg_dispatch_time = if self.cycles == 1 {
            dispatch_time
        } else {
            let prev = self.avg_dispatch_time.as_nanos() as f64;
            let cur = dispatch_time.as_nanos() as f64;
            let avg = prev + (cur - prev) / self.cycles as f64;
            Duration::from_nanos(avg as u64)
        };
    }

    pub fn total_failures(&self) -> u64 {
        self.job_failures.values().sum()
    }
}
