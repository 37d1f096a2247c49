//! Subprocess runner for the IPED indexer.
//!
//! # Architecture
//!
//! ```text
//! Job → build_command → java -jar iped.jar ... ─┬─ stdout → TeeWriter ─┬→ AuditLog → <output>/IPED.log
//!                                                │                      └→ ProgressWriter ─┐
//!                                                └─ stderr → TeeWriter ─┬→ AuditLog        ├→ events
//!                                                                       └→ ProgressWriter ─┘
//! ```
//!
//! The runner:
//! 1. Resolves the output directory and creates it owner-only
//! 2. Opens the append-only audit log and writes a host header
//! 3. Spawns the tool from the evidence's parent directory
//! 4. Duplicates both output streams to the log and the progress scanner
//! 5. Waits for the tool to exit, killing it if the worker shuts down
//!
//! # Example
//!
//! ```ignore
//! use iped_worker::runner::{ToolConfig, ToolRunner, ProgressWriter};
//!
//! let runner = ToolRunner::new(ToolConfig::new("/opt/iped/iped.jar"));
//! let prepared = runner.prepare(&job)?;
//! runner.spawn(&job, prepared, ProgressWriter::new(&job.evidence_path, tx), &mut ctx)?;
//! ctx.wait_tool(&shutdown).await?;
//! ```

pub mod capture;
pub mod command;
pub mod config;
pub mod executor;

pub use capture::{AuditLog, DuplicationMismatch, ProgressWriter, TeeWriter};
pub use command::{build_args, build_command};
pub use config::{ToolConfig, DEFAULT_MEMORY, DEFAULT_PROFILE, LOG_FILE_NAME};
pub use executor::{PreparedRun, RunningTool, ToolRunner};
