//! Job intake: where jobs come from.
//!
//! Three sources feed the [`JobCoordinator`]:
//!
//! - a single job supplied at start-up ([`run_single`]);
//! - an HTTP hand-off that waits briefly for an early failure before
//!   answering ([`submit`]);
//! - a polling [`Watcher`] against a remote "pending jobs" endpoint.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::coordinator::{JobCoordinator, JobOutcome};
use crate::error::{DispatchError, JobError};
use crate::job::Job;

/// How long an HTTP submission waits for an early failure.
pub const START_GRACE: Duration = Duration::from_secs(5);

/// Pause between two polls that returned no job.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Time allowed to start the jobs of one fetched batch.
pub const BATCH_DEADLINE: Duration = Duration::from_secs(60);

/// Upper bound on a whole watch.
pub const WATCH_DEADLINE: Duration = Duration::from_secs(60 * 60);

/// Runs one pre-supplied job.
pub async fn run_single(coordinator: &JobCoordinator, job: &Job) -> Result<JobOutcome, JobError> {
    info!(evidence = %job.evidence_path, "Using single job");
    coordinator.run(job).await
}

/// Answer to an HTTP submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The job is still running after the grace period.
    Started,
    /// The job finished successfully within the grace period.
    Completed(JobOutcome),
}

/// Starts `job` in the background and waits up to `grace` for its result.
///
/// Errors returned here happened within the grace period; later failures
/// are only visible through notifications and metrics. The job keeps
/// running after the answer and is stopped by the coordinator's shutdown.
pub async fn submit(
    coordinator: Arc<JobCoordinator>,
    job: Job,
    grace: Duration,
) -> Result<Submission, JobError> {
    let task = coordinator.spawn(job);

    match tokio::time::timeout(grace, task).await {
        Ok(Ok(result)) => result.map(Submission::Completed),
        Ok(Err(e)) => Err(JobError::Aborted(e.to_string())),
        Err(_) => {
            debug!(grace_ms = grace.as_millis() as u64, "Job still running after grace period");
            Ok(Submission::Started)
        }
    }
}

/// Counters describing one watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Requests made to the watch URL.
    pub polls: u32,
    /// Jobs that finished successfully.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Jobs not started because a deadline passed.
    pub skipped: usize,
}

/// Polls a URL returning a JSON array of jobs.
#[derive(Debug, Clone)]
pub struct Watcher {
    url: String,
    http_client: Client,
    poll_interval: Duration,
    batch_deadline: Duration,
}

impl Watcher {
    /// Creates a watcher with a 30 second request timeout.
    pub fn new(url: impl Into<String>) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url: url.into(),
            http_client,
            poll_interval: POLL_INTERVAL,
            batch_deadline: BATCH_DEADLINE,
        }
    }

    /// Sets the pause after an empty poll.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the pick-up deadline of a batch.
    pub fn with_batch_deadline(mut self, deadline: Duration) -> Self {
        self.batch_deadline = deadline;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the pending jobs. A `null` body means no job.
    pub async fn fetch(&self) -> Result<Vec<Job>, DispatchError> {
        let watch_err = |reason: String| DispatchError::Watch {
            url: self.url.clone(),
            reason,
        };

        let response = self
            .http_client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| watch_err(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(watch_err(format!("status {}", status.as_u16())));
        }

        let body = response
            .text()
            .await
            .map_err(|e| watch_err(format!("could not read body: {}", e)))?;

        let jobs: Option<Vec<Job>> =
            serde_json::from_str(&body).map_err(|e| DispatchError::Parse {
                reason: e.to_string(),
                body: body.clone(),
            })?;
        Ok(jobs.unwrap_or_default())
    }

    /// Polls until a non-empty batch arrives, runs it, and returns.
    ///
    /// No job is started once `deadline` (or the batch deadline) has
    /// passed; a job already running is allowed to finish. Transport and
    /// decoding errors end the watch, and so does the coordinator's
    /// shutdown.
    pub async fn watch(
        &self,
        coordinator: &JobCoordinator,
        deadline: Duration,
    ) -> Result<WatchSummary, DispatchError> {
        let watch_end = Instant::now() + deadline;
        let shutdown = coordinator.shutdown_token();
        let mut summary = WatchSummary::default();
        info!(url = %self.url, "Watching URL");

        loop {
            let now = Instant::now();
            if now >= watch_end {
                info!(polls = summary.polls, "Watch deadline reached");
                return Ok(summary);
            }
            if shutdown.is_cancelled() {
                info!(polls = summary.polls, "Watch stopped by shutdown");
                return Ok(summary);
            }

            summary.polls += 1;
            let jobs = self.fetch().await?;
            if jobs.is_empty() {
                let pause = self.poll_interval.min(watch_end.saturating_duration_since(now));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.cancelled() => {}
                }
                continue;
            }

            info!(jobs = jobs.len(), "Received jobs");
            let batch_end = (Instant::now() + self.batch_deadline).min(watch_end);
            run_batch(coordinator, jobs, batch_end, &mut summary).await;
            return Ok(summary);
        }
    }
}

async fn run_batch(
    coordinator: &JobCoordinator,
    jobs: Vec<Job>,
    pick_up_until: Instant,
    summary: &mut WatchSummary,
) {
    let total = jobs.len();
    for (index, job) in jobs.into_iter().enumerate() {
        if Instant::now() >= pick_up_until || coordinator.shutdown_token().is_cancelled() {
            summary.skipped = total - index;
            warn!(skipped = summary.skipped, "Batch stopped before its last job");
            return;
        }
        match coordinator.run(&job).await {
            Ok(_) => summary.succeeded += 1,
            Err(e) => {
                error!(evidence = %job.evidence_path, error = %e, "Job failed");
                summary.failed += 1;
            }
        }
    }
}
