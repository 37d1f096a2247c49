//! Worker configuration.
//!
//! `WorkerConfig` is what the command line resolves to: how to launch the
//! tool, where events go, and which job sources are enabled.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::JobCoordinator;
use crate::dispatch::{Watcher, BATCH_DEADLINE, POLL_INTERVAL, START_GRACE, WATCH_DEADLINE};
use crate::events::{HttpNotifier, Notifier};
use crate::job::Job;
use crate::lock::DistributedLock;
use crate::metrics::MetricsCollector;
use crate::runner::ToolRunner;

pub use crate::runner::ToolConfig;

/// Port of the HTTP adapter when none is configured.
pub const DEFAULT_PORT: u16 = 80;

const KERNEL_HOSTNAME: &str = "/proc/sys/kernel/hostname";

/// Everything needed to run the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How the tool is launched.
    pub tool: ToolConfig,
    /// Lock service endpoint (`LOCK`/`UNLOCK`).
    pub lock_url: String,
    /// Notification endpoint (lifecycle and progress events).
    pub notify_url: String,
    /// HTTP adapter port.
    pub port: u16,
    /// Whether `POST /start` accepts jobs.
    pub listen: bool,
    /// Polling source of jobs.
    pub watch_url: Option<String>,
    /// Job to run once at start-up.
    pub job: Option<Job>,
    pub start_grace: Duration,
    pub poll_interval: Duration,
    pub batch_deadline: Duration,
    pub watch_deadline: Duration,
}

impl WorkerConfig {
    /// Creates a configuration with default port and timings and no job
    /// source enabled.
    pub fn new(tool: ToolConfig, lock_url: impl Into<String>, notify_url: impl Into<String>) -> Self {
        Self {
            tool,
            lock_url: lock_url.into(),
            notify_url: notify_url.into(),
            port: DEFAULT_PORT,
            listen: false,
            watch_url: None,
            job: None,
            start_grace: START_GRACE,
            poll_interval: POLL_INTERVAL,
            batch_deadline: BATCH_DEADLINE,
            watch_deadline: WATCH_DEADLINE,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_watch_url(mut self, url: impl Into<String>) -> Self {
        self.watch_url = Some(url.into());
        self
    }

    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }

    /// Address the HTTP adapter binds to (all interfaces).
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Whether the worker has a finite amount of work (a single job or a
    /// watch) and should exit once it is done, unless it also listens.
    pub fn exits_when_idle(&self) -> bool {
        !self.listen && (self.job.is_some() || self.watch_url.is_some())
    }

    /// Wires a coordinator reporting to the configured endpoints.
    pub fn coordinator(&self) -> JobCoordinator {
        let lock_service: Arc<dyn Notifier> = Arc::new(HttpNotifier::new(self.lock_url.as_str()));
        let notifier: Arc<dyn Notifier> = Arc::new(HttpNotifier::new(self.notify_url.as_str()));
        JobCoordinator::new(
            DistributedLock::new(lock_service),
            ToolRunner::new(self.tool.clone()),
            notifier,
            MetricsCollector::new(self.tool.hostname.as_str()),
        )
    }

    /// Watcher for the configured polling source, if any.
    pub fn watcher(&self) -> Option<Watcher> {
        self.watch_url.as_deref().map(|url| {
            Watcher::new(url)
                .with_poll_interval(self.poll_interval)
                .with_batch_deadline(self.batch_deadline)
        })
    }
}

/// Host identity from the kernel, or `localhost`.
pub fn detect_hostname() -> String {
    fs::read_to_string(KERNEL_HOSTNAME)
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
