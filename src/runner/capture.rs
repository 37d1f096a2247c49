//! Output capture: duplicate tool output to the audit log and a progress
//! scanner.

use std::fs::File;
use std::io::{self, Write};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::Event;
use crate::metrics::MetricsCollector;
use crate::progress::Progress;

/// Longest partial line kept before it is scanned anyway.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// The two sides of a [`TeeWriter`] accepted different byte counts.
#[derive(Debug, Error)]
#[error("duplicated output diverged: primary wrote {primary} bytes, secondary wrote {secondary}")]
pub struct DuplicationMismatch {
    pub primary: usize,
    pub secondary: usize,
}

/// Writes every byte to a primary target, then the same bytes to a
/// secondary target.
///
/// The primary's byte count is authoritative; a secondary that accepts a
/// different count fails the write with [`DuplicationMismatch`].
#[derive(Debug)]
pub struct TeeWriter<P, S> {
    primary: P,
    secondary: S,
}

impl<P: Write, S: Write> TeeWriter<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        Self { primary, secondary }
    }

    pub fn secondary_mut(&mut self) -> &mut S {
        &mut self.secondary
    }
}

impl<P: Write, S: Write> Write for TeeWriter<P, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let primary = self.primary.write(buf)?;
        let secondary = self.secondary.write(&buf[..primary])?;
        if secondary != primary {
            return Err(io::Error::other(DuplicationMismatch { primary, secondary }));
        }
        Ok(primary)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}

/// Writable handle on the audit log.
///
/// Writes are queued to a blocking task that owns the file, so capturing
/// tool output never does disk I/O on a runtime worker. Clones share the
/// same file; the task ends once every handle is dropped.
#[derive(Debug, Clone)]
pub struct AuditLog {
    chunks: mpsc::UnboundedSender<Vec<u8>>,
}

impl AuditLog {
    /// Hands `file` to a blocking writer task; the task yields the first
    /// write error, if any.
    pub fn start(file: File) -> (Self, JoinHandle<io::Result<()>>) {
        let (chunks, mut queued) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::task::spawn_blocking(move || {
            let mut file = file;
            while let Some(chunk) = queued.blocking_recv() {
                file.write_all(&chunk)?;
            }
            file.flush()
        });
        (Self { chunks }, writer)
    }
}

impl Write for AuditLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.chunks
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "audit log writer stopped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Line scanner that turns progress lines into events.
///
/// Every complete line (terminated by `\n` or `\r`) is run through the
/// progress extractor. Matching lines update the progress gauges and are
/// offered to the event channel without blocking; when the channel is full
/// the event is dropped, which the throttle would do anyway.
///
/// A writer buffers one stream's partial line; use [`ProgressWriter::sibling`]
/// for each additional stream.
#[derive(Debug)]
pub struct ProgressWriter {
    evidence: String,
    pending: Vec<u8>,
    events: mpsc::Sender<Event>,
    metrics: Option<MetricsCollector>,
}

impl ProgressWriter {
    pub fn new(evidence: impl Into<String>, events: mpsc::Sender<Event>) -> Self {
        Self {
            evidence: evidence.into(),
            pending: Vec::new(),
            events,
            metrics: None,
        }
    }

    /// Records progress counts on `metrics` as lines are seen.
    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A writer on the same channel and metrics with its own line buffer.
    pub fn sibling(&self) -> Self {
        Self {
            evidence: self.evidence.clone(),
            pending: Vec::new(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Scans whatever partial line is still buffered.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.observe_line(&line);
        }
    }

    fn observe_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        let Some(progress) = Progress::parse(text) else {
            return;
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_progress(&self.evidence, progress);
        }

        match self
            .events
            .try_send(Event::progress(self.evidence.as_str(), text))
        {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("Progress channel full, dropping line"),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let (head, tail) = rest.split_at(pos);
            if self.pending.is_empty() {
                self.observe_line(head);
            } else {
                self.pending.extend_from_slice(head);
                let line = std::mem::take(&mut self.pending);
                self.observe_line(&line);
            }
            rest = &tail[1..];
        }

        self.pending.extend_from_slice(rest);
        if self.pending.len() > MAX_PENDING_LINE {
            let line = std::mem::take(&mut self.pending);
            self.observe_line(&line);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
