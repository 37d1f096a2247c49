//! Command-line interface for iped-worker.
//!
//! Parses flags (with environment fallbacks) into a `WorkerConfig` and runs
//! the worker.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, run_worker, Cli, JobArgs};
