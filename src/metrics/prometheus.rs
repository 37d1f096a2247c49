//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics exposed by the worker and
//! provides functions for initializing, registering, and exporting them.

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, OnceLock};

/// Serializes initialization so every metric lands in the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all worker metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of jobs handed to the coordinator, labeled by hostname and evidence.
pub static CALLS: OnceLock<CounterVec> = OnceLock::new();

/// Number of finished jobs, labeled by hostname, evidence and result.
pub static FINISH: OnceLock<CounterVec> = OnceLock::new();

/// Whether the tool is currently running (0 or 1).
pub static RUNNING: OnceLock<GaugeVec> = OnceLock::new();

/// Latest number of items found by the tool.
pub static FOUND: OnceLock<GaugeVec> = OnceLock::new();

/// Latest number of items processed by the tool.
pub static PROCESSED: OnceLock<GaugeVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Calling it
/// again is harmless: the first set of metrics stays registered.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _init = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let calls = CounterVec::new(
        Opts::new("ipedworker_runIped_calls", "Number of calls to runIped"),
        &["hostname", "evidence"],
    )?;

    let finish = CounterVec::new(
        Opts::new("ipedworker_runIped_finish", "Number of finished runs"),
        &["hostname", "evidence", "result"],
    )?;

    let running = GaugeVec::new(
        Opts::new("ipedworker_runIped_running", "Whether IPED is running or not"),
        &["hostname", "evidence"],
    )?;

    let found = GaugeVec::new(
        Opts::new("ipedworker_runIped_found", "Number of items found"),
        &["hostname", "evidence"],
    )?;

    let processed = GaugeVec::new(
        Opts::new("ipedworker_runIped_processed", "Number of items processed"),
        &["hostname", "evidence"],
    )?;

    registry.register(Box::new(calls.clone()))?;
    registry.register(Box::new(finish.clone()))?;
    registry.register(Box::new(running.clone()))?;
    registry.register(Box::new(found.clone()))?;
    registry.register(Box::new(processed.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = CALLS.set(calls);
    let _ = FINISH.set(finish);
    let _ = RUNNING.set(running);
    let _ = FOUND.set(found);
    let _ = PROCESSED.set(processed);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
