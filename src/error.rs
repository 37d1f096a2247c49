//! Error types for iped-worker operations.
//!
//! Defines error types for every stage of a job's lifecycle:
//! - Notification delivery (lifecycle, progress and lock events)
//! - Distributed lock acquisition and release
//! - Subprocess preparation, spawn, output capture and exit
//! - Output finalization (permissions, relocation)
//! - Job dispatch (polling a remote job source)
//!
//! [`JobError`] is the single terminal error a job produces.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while delivering an event to a remote endpoint.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request to '{url}' failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Response from '{url}' not ok: {status}")]
    Status { url: String, status: u16 },
}

/// Errors that can occur while claiming or releasing the execution slot.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Remote lock rejected evidence '{evidence}': {source}")]
    Acquire {
        evidence: String,
        #[source]
        source: NotifyError,
    },

    #[error("Remote unlock failed for evidence '{evidence}': {source}")]
    Release {
        evidence: String,
        #[source]
        source: NotifyError,
    },

    #[error("Worker shut down while '{evidence}' waited for the execution slot")]
    Cancelled { evidence: String },
}

/// Errors that can occur while running the external tool.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to prepare output directory '{path}': {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool exited unsuccessfully: {0}")]
    Exited(std::process::ExitStatus),

    #[error("Failed to capture tool output: {0}")]
    Capture(std::io::Error),

    #[error("Failed to wait for tool: {0}")]
    Wait(std::io::Error),

    #[error("Tool stopped on worker shutdown")]
    Cancelled,
}

impl RunError {
    /// Whether the tool never started (the job never reached "running").
    pub fn is_spawn(&self) -> bool {
        matches!(self, RunError::Prepare { .. } | RunError::Spawn { .. })
    }
}

/// Errors that can occur while finalizing the output tree.
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Failed to set permissions on '{path}': {source}")]
    Permissions {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Cannot move '{from}' into its own subtree '{to}'")]
    DestinationInside { from: PathBuf, to: PathBuf },

    #[error("Failed to move '{from}' to '{to}': {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Finalize task aborted: {0}")]
    Aborted(String),
}

/// Terminal error of a single job, one variant per failure class.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Spawn error: {0}")]
    Spawn(RunError),

    #[error("Execution error: {0}")]
    Execution(RunError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Finalize error: {0}")]
    Finalize(#[from] FinalizeError),

    #[error("Job task aborted: {0}")]
    Aborted(String),
}

impl From<RunError> for JobError {
    fn from(err: RunError) -> Self {
        if err.is_spawn() {
            JobError::Spawn(err)
        } else {
            JobError::Execution(err)
        }
    }
}

/// Errors that can occur while fetching jobs from a remote source.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Could not watch URL '{url}': {reason}")]
    Watch { url: String, reason: String },

    #[error("Could not parse JSON: {reason}; data: {body}")]
    Parse { reason: String, body: String },
}
