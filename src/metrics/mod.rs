//! Metrics module for Prometheus-based monitoring.
//!
//! The coordinator updates these as a side effect of running jobs; the HTTP
//! adapter exposes them on `/metrics`.
//!
//! # Example
//!
//! ```ignore
//! use iped_worker::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new("worker-01");
//! collector.record_call("/data/case1");
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{FinishResult, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{CALLS, FINISH, FOUND, PROCESSED, REGISTRY, RUNNING};
