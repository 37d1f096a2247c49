//! Tool execution - prepare, spawn, capture, wait.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{AuditLog, ProgressWriter, TeeWriter};
use super::command::build_command;
use super::config::{ToolConfig, LOG_FILE_NAME};
use crate::error::RunError;
use crate::job::Job;
use crate::lock::ExecutionContext;

/// Permissions of the output directory while the tool runs.
#[cfg(unix)]
const RUNNING_DIR_MODE: u32 = 0o700;

const CAPTURE_CHUNK: usize = 8 * 1024;

/// Output directory and audit log, ready for a spawn.
#[derive(Debug)]
pub struct PreparedRun {
    /// Absolute output directory.
    pub output_dir: PathBuf,
    /// Audit log inside the output directory.
    pub log_path: PathBuf,
    log_file: File,
}

/// Runs the external tool for one job.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    config: ToolConfig,
}

impl ToolRunner {
    /// Creates a runner with the given tool configuration.
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Creates the output directory owner-only and opens the audit log.
    ///
    /// The log is opened in append mode and gets a one-line header naming
    /// this host.
    pub fn prepare(&self, job: &Job) -> Result<PreparedRun, RunError> {
        let output_dir = job.output_dir();
        let prepare_err = |source| RunError::Prepare {
            path: output_dir.clone(),
            source,
        };

        fs::create_dir_all(&output_dir).map_err(prepare_err)?;
        restrict_permissions(&output_dir).map_err(prepare_err)?;

        let log_path = output_dir.join(LOG_FILE_NAME);
        let mut log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(prepare_err)?;

        writeln!(
            log_file,
            "[{}] iped-worker on host {} processing {}",
            Utc::now().to_rfc3339(),
            self.config.hostname,
            job.evidence_path
        )
        .map_err(prepare_err)?;

        debug!(output_dir = %output_dir.display(), "Output directory prepared");

        Ok(PreparedRun {
            output_dir,
            log_path,
            log_file,
        })
    }

    /// Spawns the tool and attaches it to `context`.
    ///
    /// Each output stream is duplicated to the audit log and to its own
    /// progress scanner; both scanners feed the channel of `progress`.
    pub fn spawn(
        &self,
        job: &Job,
        prepared: PreparedRun,
        progress: ProgressWriter,
        context: &mut ExecutionContext,
    ) -> Result<(), RunError> {
        let mut cmd = build_command(job, &self.config);
        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: self.config.java.clone(),
            source,
        })?;

        info!(
            pid = child.id(),
            evidence = %job.evidence_path,
            output = %prepared.output_dir.display(),
            "Tool started"
        );

        let (log, log_writer) = AuditLog::start(prepared.log_file);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump(stdout, TeeWriter::new(log.clone(), progress.sibling())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump(stderr, TeeWriter::new(log, progress)));
        }

        context.attach(RunningTool {
            child,
            pumps,
            log_writer: Some(log_writer),
        });
        Ok(())
    }
}

/// A spawned tool whose output is being captured.
///
/// Dropping it kills the process.
#[derive(Debug)]
pub struct RunningTool {
    child: Child,
    pumps: Vec<JoinHandle<io::Result<()>>>,
    log_writer: Option<JoinHandle<io::Result<()>>>,
}

impl RunningTool {
    /// Kills the tool and reaps it.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to kill tool");
        }
    }

    /// Waits for exit and for the capture to drain.
    ///
    /// When `cancel` fires first the tool is killed and the run fails with
    /// [`RunError::Cancelled`]. A non-zero exit wins over a capture failure.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), RunError> {
        let exited = tokio::select! {
            status = self.child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };
        let (status, cancelled) = match exited {
            Some(status) => (status.map_err(RunError::Wait)?, false),
            None => {
                warn!(pid = self.child.id(), "Stopping tool on shutdown");
                if let Err(e) = self.child.start_kill() {
                    warn!(error = %e, "Failed to kill tool");
                }
                (self.child.wait().await.map_err(RunError::Wait)?, true)
            }
        };

        let mut capture_error = None;
        for pump in self.pumps.drain(..) {
            if let Err(e) = joined(pump.await) {
                warn!(error = %e, "Output capture failed");
                capture_error.get_or_insert(e);
            }
        }
        // The pumps held the last log handles, so the writer is done.
        if let Some(writer) = self.log_writer.take() {
            if let Err(e) = joined(writer.await) {
                warn!(error = %e, "Audit log write failed");
                capture_error.get_or_insert(e);
            }
        }

        info!(status = %status, "Tool exited");

        if cancelled {
            return Err(RunError::Cancelled);
        }
        if !status.success() {
            return Err(RunError::Exited(status));
        }
        if let Some(e) = capture_error {
            return Err(RunError::Capture(e));
        }
        Ok(())
    }
}

fn joined(result: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    result.unwrap_or_else(|e| Err(io::Error::other(e.to_string())))
}

/// Copies one stream into `tee` until end of file.
///
/// After a write failure the stream is still drained so the tool never
/// blocks on a full pipe; the first failure is returned.
fn pump<R>(mut reader: R, mut tee: TeeWriter<AuditLog, ProgressWriter>) -> JoinHandle<io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; CAPTURE_CHUNK];
        let mut failure = None;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if failure.is_none() {
                if let Err(e) = tee.write_all(&buf[..n]) {
                    failure = Some(e);
                }
            }
        }
        tee.secondary_mut().finish();
        failure.map_or(Ok(()), Err)
    })
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(RUNNING_DIR_MODE))
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) -> io::Result<()> {
    Ok(())
}
