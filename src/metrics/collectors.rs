//! High-level recording interface over the raw Prometheus metrics.
//!
//! The `MetricsCollector` binds the host identity once and exposes one
//! method per job lifecycle observation. Recording is a no-op until
//! `init_metrics()` has been called.

use super::prometheus::{CALLS, FINISH, FOUND, PROCESSED, RUNNING};
use crate::progress::Progress;

/// Result label for a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishResult {
    Done,
    Failed,
}

impl FinishResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishResult::Done => "done",
            FinishResult::Failed => "failed",
        }
    }
}

/// Metrics collector for recording job lifecycle metrics.
///
/// # Example
///
/// ```ignore
/// use iped_worker::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics()?;
/// let collector = MetricsCollector::new("worker-01");
/// collector.record_call("/data/case1");
/// collector.set_running("/data/case1", true);
/// ```
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    hostname: String,
}

impl MetricsCollector {
    /// Creates a collector labelling every sample with `hostname`.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
        }
    }

    /// Record a job accepted by the coordinator.
    pub fn record_call(&self, evidence: &str) {
        if let Some(calls) = CALLS.get() {
            calls.with_label_values(&[self.hostname.as_str(), evidence]).inc();
        }
    }

    /// Record a job reaching a terminal state.
    pub fn record_finish(&self, evidence: &str, result: FinishResult) {
        if let Some(finish) = FINISH.get() {
            finish
                .with_label_values(&[self.hostname.as_str(), evidence, result.as_str()])
                .inc();
        }

        tracing::trace!(evidence, result = result.as_str(), "Recorded finish metric");
    }

    /// Flip the running gauge.
    pub fn set_running(&self, evidence: &str, running: bool) {
        if let Some(gauge) = RUNNING.get() {
            gauge
                .with_label_values(&[self.hostname.as_str(), evidence])
                .set(if running { 1.0 } else { 0.0 });
        }
    }

    /// Record the latest processed/found counts.
    pub fn record_progress(&self, evidence: &str, progress: Progress) {
        if let Some(gauge) = PROCESSED.get() {
            gauge
                .with_label_values(&[self.hostname.as_str(), evidence])
                .set(progress.processed as f64);
        }
        if let Some(gauge) = FOUND.get() {
            gauge
                .with_label_values(&[self.hostname.as_str(), evidence])
                .set(progress.found as f64);
        }
    }
}
