//! iped-worker: runs the IPED forensic indexer on evidence, one job at a time.
//!
//! A job is locked through a remote lock service, executed as a JVM
//! subprocess whose output is tee'd to an audit log and scanned for
//! progress, reported through lifecycle notifications, finalized
//! (permissions, optional relocation) and unlocked.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod finalize;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod server;

// Re-export commonly used types
pub use coordinator::{JobCoordinator, JobOutcome};
pub use error::{DispatchError, FinalizeError, JobError, LockError, NotifyError, RunError};
pub use job::Job;
