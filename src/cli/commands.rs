//! CLI definitions for iped-worker.
//!
//! Every flag can also be set through the environment variable named in
//! its help text, so the worker can be configured entirely from a
//! container manifest.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{detect_hostname, ToolConfig, WorkerConfig};
use crate::coordinator::JobCoordinator;
use crate::dispatch;
use crate::job::Job;
use crate::metrics::init_metrics;
use crate::runner::{DEFAULT_MEMORY, DEFAULT_PROFILE};
use crate::server::{self, AppState};

/// Worker that runs the IPED indexer on evidence, one job at a time.
#[derive(Parser, Debug)]
#[command(name = "iped-worker")]
#[command(about = "Run IPED processing jobs behind a distributed lock")]
#[command(version)]
#[command(
    long_about = "iped-worker runs the IPED indexer on evidence, one job at a time.\n\nJobs come from a single --evidence-path, from POST /start (--listen), or from polling --watch-url.\nLifecycle and progress events are posted to --notify-url; LOCK/UNLOCK to --lock-url.\n\nExample usage:\n  iped-worker --jar /opt/iped/iped.jar --lock-url http://locker/lock --notify-url http://hub/events --listen"
)]
pub struct Cli {
    /// Path to the IPED jar.
    #[arg(long, env = "IPEDJAR")]
    pub jar: PathBuf,

    /// Lock service endpoint.
    #[arg(long, env = "LOCK_URL")]
    pub lock_url: String,

    /// Notification endpoint for lifecycle and progress events.
    #[arg(long, env = "NOTIFY_URL")]
    pub notify_url: String,

    /// HTTP port for health, readiness, metrics and job submission.
    #[arg(long, env = "PORT", default_value_t = crate::config::DEFAULT_PORT)]
    pub port: u16,

    /// Poll this URL for a JSON array of jobs.
    #[arg(long, env = "WATCH_URL")]
    pub watch_url: Option<String>,

    /// Accept jobs on POST /start.
    #[arg(long, env = "LISTEN")]
    pub listen: bool,

    /// JVM heap size.
    #[arg(long, env = "MEMORY", default_value = DEFAULT_MEMORY)]
    pub memory: String,

    /// JVM launcher.
    #[arg(long, env = "JAVA_BIN", default_value = "java")]
    pub java: String,

    /// Extra option for the JVM launcher (repeatable).
    #[arg(long = "jvm-option", allow_hyphen_values = true)]
    pub jvm_options: Vec<String>,

    /// Profile used when a job names none.
    #[arg(long, env = "IPED_PROFILE", default_value = DEFAULT_PROFILE)]
    pub default_profile: String,

    /// Host identity for the audit log header and metric labels
    /// (defaults to the kernel hostname).
    #[arg(long, env = "IPED_HOSTNAME")]
    pub hostname: Option<String>,

    /// Single job to run at start-up.
    #[command(flatten)]
    pub job: JobArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

/// Fields of a job supplied on the command line.
#[derive(clap::Args, Debug, Default)]
pub struct JobArgs {
    /// Evidence to process; enables single-job mode.
    #[arg(long, env = "EVIDENCE_PATH")]
    pub evidence_path: Option<String>,

    /// Output directory, absolute or relative to the evidence's parent.
    #[arg(long, env = "OUTPUT_PATH")]
    pub output_path: Option<String>,

    /// Tool profile for this job.
    #[arg(long, env = "IPED_JOB_PROFILE")]
    pub profile: Option<String>,

    /// Extra tool arguments, whitespace separated.
    #[arg(long, env = "ADDITIONAL_ARGS", allow_hyphen_values = true)]
    pub additional_args: Option<String>,

    /// Extra evidence sources, one per line.
    #[arg(long, env = "ADDITIONAL_PATHS")]
    pub additional_paths: Option<String>,

    /// Move the output here after a successful run.
    #[arg(long, env = "MV_PATH")]
    pub mv_path: Option<String>,
}

impl JobArgs {
    /// The job, when an evidence path was given.
    pub fn to_job(&self) -> Option<Job> {
        let evidence = self.evidence_path.as_deref()?;
        Some(Job {
            evidence_path: evidence.to_string(),
            output_path: self.output_path.clone().unwrap_or_default(),
            profile: self.profile.clone().unwrap_or_default(),
            additional_args: self.additional_args.clone().unwrap_or_default(),
            additional_paths: self.additional_paths.clone().unwrap_or_default(),
            relocate_path: self.mv_path.clone().unwrap_or_default(),
        })
    }
}

impl Cli {
    /// Resolves the parsed flags into a worker configuration.
    pub fn to_config(&self) -> WorkerConfig {
        let hostname = self
            .hostname
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(detect_hostname);

        let tool = self.jvm_options.iter().fold(
            ToolConfig::new(&self.jar)
                .with_java(self.java.as_str())
                .with_memory(self.memory.as_str())
                .with_default_profile(self.default_profile.as_str())
                .with_hostname(hostname),
            |tool, option| tool.with_jvm_option(option.as_str()),
        );

        let mut config = WorkerConfig::new(tool, self.lock_url.as_str(), self.notify_url.as_str())
            .with_port(self.port)
            .with_listen(self.listen);
        if let Some(url) = &self.watch_url {
            config = config.with_watch_url(url.as_str());
        }
        if let Some(job) = self.job.to_job() {
            config = config.with_job(job);
        }
        config
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the worker by parsing arguments first.
///
/// For control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the worker with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    run_worker(cli.to_config()).await
}

/// Serves the HTTP adapter and runs the configured job sources.
///
/// Returns once a single job or a watch has finished (unless listening for
/// jobs), or on Ctrl-C / SIGTERM. On a signal the running tool is killed
/// and its job reports `failed` and unlocks before this returns.
pub async fn run_worker(config: WorkerConfig) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let coordinator = Arc::new(config.coordinator());
    let state = AppState::new(Arc::clone(&coordinator)).with_start_grace(config.start_grace);
    let app = server::router(state, config.listen);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        port = config.port,
        listen = config.listen,
        watch_url = config.watch_url.as_deref().unwrap_or(""),
        hostname = %config.tool.hostname,
        "Starting iped-worker"
    );

    let shutdown = coordinator.shutdown_token().clone();
    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            server::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let stop_server = shutdown.child_token();
    let server = tokio::spawn(server::serve(listener, app, {
        let stop_server = stop_server.clone();
        async move { stop_server.cancelled().await }
    }));

    let outcome = run_sources(&config, &coordinator).await;

    if config.exits_when_idle() || outcome.is_err() {
        stop_server.cancel();
    }
    let served = server.await;
    signals.abort();
    coordinator.shutdown().await;

    served
        .context("HTTP server task panicked")?
        .context("HTTP server failed")?;

    outcome
}

async fn run_sources(config: &WorkerConfig, coordinator: &JobCoordinator) -> anyhow::Result<()> {
    if let Some(job) = &config.job {
        match dispatch::run_single(coordinator, job).await {
            Ok(outcome) => info!(location = %outcome.location.display(), "Single job done"),
            Err(e) => {
                error!(evidence = %job.evidence_path, error = %e, "Single job failed");
                return Err(e).context("Single job failed");
            }
        }
    }

    if let Some(watcher) = config.watcher() {
        let summary = watcher
            .watch(coordinator, config.watch_deadline)
            .await
            .context("Watch failed")?;
        info!(
            polls = summary.polls,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Watch finished"
        );
    }

    Ok(())
}
