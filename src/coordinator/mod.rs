//! Job coordinator: one job from lock to unlock.
//!
//! # State machine
//!
//! ```text
//! Idle → Locking → Running → Finalizing → {Done, Failed} → Unlocked
//!           │          │                        ▲
//!           │          └── spawn/exit/notify ───┘
//!           └── lock rejected → Failed (nothing to unlock)
//! ```
//!
//! Lifecycle events (`running`, `done`, `failed`) are sent synchronously to
//! the notifier and their delivery failure becomes a job error. Progress
//! events travel through an [`EventThrottle`] that is only started once
//! `running` has been delivered, and is drained before the terminal event,
//! so a single job always reports `LOCK, running, progress*, done|failed,
//! UNLOCK`.
//!
//! On shutdown ([`JobCoordinator::shutdown`]) a running tool is killed and
//! its job ends as `failed` followed by `UNLOCK`; jobs started through
//! [`JobCoordinator::spawn`] are awaited before shutdown returns.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{FinalizeError, JobError};
use crate::events::{Event, EventThrottle, EventType, Notifier, ThrottleStats, PROGRESS_WINDOW};
use crate::finalize::finalize;
use crate::job::Job;
use crate::lock::{DistributedLock, LockGuard, LockState};
use crate::metrics::{FinishResult, MetricsCollector};
use crate::runner::{ProgressWriter, ToolRunner};

/// Progress events buffered between the capture writer and the throttle.
const PROGRESS_BUFFER: usize = 256;

/// Result of a successful job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// Identifier used in this job's log records.
    pub job_id: Uuid,
    /// Where the output tree ended up.
    pub location: PathBuf,
    /// Progress delivery counters.
    pub deliveries: ThrottleStats,
}

/// Runs jobs one at a time through lock, tool, notification and finalize.
#[derive(Clone)]
pub struct JobCoordinator {
    lock: DistributedLock,
    runner: ToolRunner,
    notifier: Arc<dyn Notifier>,
    metrics: MetricsCollector,
    progress_window: Duration,
    shutdown: CancellationToken,
    jobs: TaskTracker,
}

impl JobCoordinator {
    pub fn new(
        lock: DistributedLock,
        runner: ToolRunner,
        notifier: Arc<dyn Notifier>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            lock,
            runner,
            notifier,
            metrics,
            progress_window: PROGRESS_WINDOW,
            shutdown: CancellationToken::new(),
            jobs: TaskTracker::new(),
        }
    }

    /// Sets the minimum spacing of forwarded progress events.
    pub fn with_progress_window(mut self, window: Duration) -> Self {
        self.progress_window = window;
        self
    }

    /// Readiness state shared with the lock.
    pub fn lock_state(&self) -> &LockState {
        self.lock.state()
    }

    /// Cancelled once the worker shuts down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Runs `job` to a terminal state.
    ///
    /// Validation failures are returned before anything is locked. Once the
    /// lock is held it is released on every path.
    pub async fn run(&self, job: &Job) -> Result<JobOutcome, JobError> {
        job.validate()?;
        if self.shutdown.is_cancelled() {
            return Err(JobError::Aborted("worker is shutting down".to_string()));
        }
        self.execute(Uuid::new_v4(), job).await
    }

    /// Runs `job` on a background task that [`JobCoordinator::shutdown`]
    /// waits for.
    pub fn spawn(self: &Arc<Self>, job: Job) -> JoinHandle<Result<JobOutcome, JobError>> {
        let coordinator = Arc::clone(self);
        self.jobs.spawn(async move { coordinator.run(&job).await })
    }

    /// Stops the running tool, refuses new jobs and waits for every
    /// background job to unlock.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.jobs.close();
        if !self.jobs.is_empty() {
            info!(jobs = self.jobs.len(), "Waiting for running jobs to stop");
        }
        self.jobs.wait().await;
    }

    #[instrument(skip(self, job), fields(evidence = %job.evidence_path))]
    async fn execute(&self, job_id: Uuid, job: &Job) -> Result<JobOutcome, JobError> {
        let evidence = job.evidence_path.as_str();
        self.metrics.record_call(evidence);

        let mut guard = match self.lock.acquire_until(evidence, &self.shutdown).await {
            Ok(guard) => guard,
            Err(e) => {
                self.metrics.record_finish(evidence, FinishResult::Failed);
                return Err(e.into());
            }
        };

        let result = self.run_locked(job_id, job, &mut guard).await;
        self.metrics.set_running(evidence, false);

        if let Err(e) = guard.release().await {
            debug!(error = %e, "Unlock not confirmed by lock service");
        }

        match &result {
            Ok(outcome) => {
                self.metrics.record_finish(evidence, FinishResult::Done);
                info!(location = %outcome.location.display(), "Job done");
            }
            Err(e) => {
                self.metrics.record_finish(evidence, FinishResult::Failed);
                error!(error = %e, "Job failed");
            }
        }
        result
    }

    async fn run_locked(
        &self,
        job_id: Uuid,
        job: &Job,
        guard: &mut LockGuard,
    ) -> Result<JobOutcome, JobError> {
        let evidence = job.evidence_path.as_str();
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let progress = ProgressWriter::new(evidence, tx).with_metrics(self.metrics.clone());

        let prepared = match self.runner.prepare(job) {
            Ok(prepared) => prepared,
            Err(e) => return self.conclude(evidence, Err(e.into())).await,
        };
        let output_dir = prepared.output_dir.clone();
        if let Err(e) = self.runner.spawn(job, prepared, progress, guard.context_mut()) {
            return self.conclude(evidence, Err(e.into())).await;
        }

        if let Err(source) = self
            .notifier
            .notify(&Event::new(EventType::Running, evidence))
            .await
        {
            warn!(error = %source, "Could not report running, stopping tool");
            let context = guard.context_mut();
            if let Some(tool) = context.tool_mut() {
                tool.kill().await;
            }
            if let Err(e) = context.wait_tool(&self.shutdown).await {
                debug!(error = %e, "Stopped tool");
            }
            return self.conclude(evidence, Err(JobError::Notify(source))).await;
        }
        self.metrics.set_running(evidence, true);

        let throttle = EventThrottle::new(Arc::clone(&self.notifier)).with_window(self.progress_window);
        let delivery = tokio::spawn(throttle.run(rx));

        let run_result = guard.context_mut().wait_tool(&self.shutdown).await;

        let deliveries = match delivery.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Progress delivery task aborted");
                ThrottleStats::default()
            }
        };
        debug!(
            received = deliveries.received,
            dispatched = deliveries.dispatched,
            dropped = deliveries.dropped,
            failed = deliveries.failed,
            "Progress delivery finished"
        );

        let outcome = match run_result {
            Err(e) => Err(JobError::from(e)),
            Ok(()) => {
                let relocate_to = job.relocate_to();
                let finalizing =
                    tokio::task::spawn_blocking(move || finalize(&output_dir, relocate_to.as_deref()));
                match finalizing.await {
                    Ok(Ok(finalized)) => Ok(JobOutcome {
                        job_id,
                        location: finalized.location,
                        deliveries,
                    }),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(FinalizeError::Aborted(e.to_string()).into()),
                }
            }
        };

        self.conclude(evidence, outcome).await
    }

    /// Sends the terminal event for `outcome`.
    ///
    /// A finalize failure still reports `done` (the tool succeeded), with
    /// the finalize error as progress text. A delivery failure replaces a
    /// successful outcome and is only logged otherwise.
    async fn conclude(
        &self,
        evidence: &str,
        outcome: Result<JobOutcome, JobError>,
    ) -> Result<JobOutcome, JobError> {
        let event = match &outcome {
            Ok(_) => Event::new(EventType::Done, evidence),
            Err(e @ JobError::Finalize(_)) => {
                Event::new(EventType::Done, evidence).with_progress(e.to_string())
            }
            Err(e) => Event::new(EventType::Failed, evidence).with_progress(e.to_string()),
        };

        match (self.notifier.notify(&event).await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(source), Ok(_)) => Err(JobError::Notify(source)),
            (Err(source), Err(e)) => {
                warn!(
                    event_type = %event.event_type,
                    error = %source,
                    "Could not report terminal state"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingNotifier;
    use crate::runner::ToolConfig;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        remote: RecordingNotifier,
        coordinator: JobCoordinator,
    }

    impl Fixture {
        fn job(&self) -> Job {
            Job::new(self.tmp.path().join("case1").to_string_lossy()).with_output("OUT")
        }

        fn output_dir(&self) -> PathBuf {
            self.tmp.path().join("OUT")
        }
    }

    /// The same recorder serves as lock service and notifier so the whole
    /// event sequence is observed in order.
    fn fixture_with_tool(tool: ToolConfig) -> Fixture {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("case1")).unwrap();
        let remote = RecordingNotifier::new();
        let shared: Arc<dyn Notifier> = Arc::new(remote.clone());
        let coordinator = JobCoordinator::new(
            DistributedLock::new(Arc::clone(&shared)),
            ToolRunner::new(tool),
            shared,
            MetricsCollector::new("test-host"),
        );
        Fixture {
            tmp,
            remote,
            coordinator,
        }
    }

    fn fixture(body: &str) -> Fixture {
        fixture_with_tool(
            ToolConfig::new("/opt/iped/iped.jar")
                .with_java("/bin/sh")
                .with_jvm_option("-c")
                .with_jvm_option(body)
                .with_jvm_option("fake-java")
                .with_hostname("test-host"),
        )
    }

    fn lifecycle(remote: &RecordingNotifier) -> Vec<EventType> {
        remote
            .types()
            .into_iter()
            .filter(|t| !t.is_progress())
            .collect()
    }

    #[tokio::test]
    async fn test_successful_job_lifecycle() {
        let fx = fixture("echo \"[MSG] Processando 2153/3591 (7%)\"\nexit 0");

        let outcome = fx.coordinator.run(&fx.job()).await.unwrap();

        assert_eq!(outcome.location, fx.output_dir());
        let types = fx.remote.types();
        assert_eq!(types.first(), Some(&EventType::Lock));
        assert_eq!(types.get(1), Some(&EventType::Running));
        assert_eq!(
            &types[types.len() - 2..],
            &[EventType::Done, EventType::Unlock]
        );
        assert!(fx.remote.count(EventType::Progress) <= 1);
        assert!(fx.coordinator.lock_state().is_ready());

        let mode = fs::metadata(fx.output_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_progress_is_forwarded_between_running_and_done() {
        let fx = fixture("echo \"Processando 5/10\"\nexit 0");

        let outcome = fx.coordinator.run(&fx.job()).await.unwrap();

        assert_eq!(
            fx.remote.types(),
            vec![
                EventType::Lock,
                EventType::Running,
                EventType::Progress,
                EventType::Done,
                EventType::Unlock
            ]
        );
        assert_eq!(outcome.deliveries.dispatched, 1);
        let progress = &fx.remote.events()[2];
        assert_eq!(progress.progress_text(), Some("Processando 5/10"));
    }

    #[tokio::test]
    async fn test_validation_failure_touches_nothing() {
        let fx = fixture("exit 0");
        let job = Job::new(fx.tmp.path().join("missing").to_string_lossy());

        let err = fx.coordinator.run(&job).await.unwrap_err();

        assert!(matches!(err, JobError::Validation(_)));
        assert!(fx.remote.events().is_empty());
    }

    #[tokio::test]
    async fn test_lock_failure_sends_no_unlock() {
        let fx = fixture("exit 0");
        fx.remote.reject(EventType::Lock);

        let err = fx.coordinator.run(&fx.job()).await.unwrap_err();

        assert!(matches!(err, JobError::Lock(_)));
        assert_eq!(fx.remote.types(), vec![EventType::Lock]);
        assert!(!fx.output_dir().exists());
        assert!(fx.coordinator.lock_state().is_ready());
    }

    #[tokio::test]
    async fn test_spawn_failure_unlocks() {
        let tmp = TempDir::new().unwrap();
        let fx = fixture_with_tool(
            ToolConfig::new("/opt/iped/iped.jar")
                .with_java(tmp.path().join("no-java").to_string_lossy()),
        );

        let err = fx.coordinator.run(&fx.job()).await.unwrap_err();

        assert!(matches!(err, JobError::Spawn(_)));
        assert_eq!(
            fx.remote.types(),
            vec![EventType::Lock, EventType::Failed, EventType::Unlock]
        );
        assert!(fx.coordinator.lock_state().is_ready());
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_failed_and_unlocks() {
        let fx = fixture("exit 2");

        let err = fx.coordinator.run(&fx.job()).await.unwrap_err();

        assert!(matches!(err, JobError::Execution(_)));
        assert_eq!(
            lifecycle(&fx.remote),
            vec![
                EventType::Lock,
                EventType::Running,
                EventType::Failed,
                EventType::Unlock
            ]
        );
        let failed = fx
            .remote
            .events()
            .into_iter()
            .find(|e| e.event_type == EventType::Failed)
            .unwrap();
        assert!(failed.progress_text().unwrap().contains("Execution error"));
        // No finalize on failure: the directory stays owner-only.
        let mode = fs::metadata(fx.output_dir()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(fx.coordinator.lock_state().is_ready());
    }

    #[tokio::test]
    async fn test_finalize_failure_reports_done_but_fails_job() {
        let fx = fixture("exit 0");
        let taken = fx.tmp.path().join("taken");
        fs::create_dir(&taken).unwrap();
        let job = fx.job().with_relocate_path(taken.to_string_lossy());

        let err = fx.coordinator.run(&job).await.unwrap_err();

        assert!(matches!(
            err,
            JobError::Finalize(FinalizeError::DestinationExists(_))
        ));
        assert_eq!(
            lifecycle(&fx.remote),
            vec![
                EventType::Lock,
                EventType::Running,
                EventType::Done,
                EventType::Unlock
            ]
        );
        assert!(fx.output_dir().exists());
        assert!(fx.coordinator.lock_state().is_ready());
    }

    #[tokio::test]
    async fn test_relocation_moves_output() {
        let fx = fixture("exit 0");
        let dest = fx.tmp.path().join("archive").join("case1");
        let job = fx.job().with_relocate_path(dest.to_string_lossy());

        let outcome = fx.coordinator.run(&job).await.unwrap();

        assert_eq!(outcome.location, dest);
        assert!(dest.join("IPED.log").exists());
        assert!(!fx.output_dir().exists());
    }

    #[tokio::test]
    async fn test_running_notify_failure_stops_tool() {
        let fx = fixture("exec sleep 30");
        fx.remote.reject(EventType::Running);

        let err = tokio::time::timeout(Duration::from_secs(10), fx.coordinator.run(&fx.job()))
            .await
            .expect("tool must be stopped")
            .unwrap_err();

        assert!(matches!(err, JobError::Notify(_)));
        assert_eq!(
            fx.remote.types(),
            vec![
                EventType::Lock,
                EventType::Running,
                EventType::Failed,
                EventType::Unlock
            ]
        );
    }

    #[tokio::test]
    async fn test_done_notify_failure_fails_job() {
        let fx = fixture("exit 0");
        fx.remote.reject(EventType::Done);

        let err = fx.coordinator.run(&fx.job()).await.unwrap_err();

        assert!(matches!(err, JobError::Notify(_)));
        assert_eq!(fx.remote.count(EventType::Unlock), 1);
    }

    #[tokio::test]
    async fn test_unlock_failure_keeps_outcome() {
        let fx = fixture("exit 0");
        fx.remote.reject(EventType::Unlock);

        fx.coordinator.run(&fx.job()).await.unwrap();

        assert_eq!(fx.remote.count(EventType::Unlock), 1);
        assert!(fx.coordinator.lock_state().is_ready());
    }

    #[tokio::test]
    async fn test_shutdown_kills_tool_and_unlocks() {
        let fx = fixture("echo $$ > tool.pid\nexec sleep 30");
        let coordinator = Arc::new(fx.coordinator.clone());

        let job = coordinator.spawn(fx.job());
        let pid_file = fx.tmp.path().join("tool.pid");
        for _ in 0..100 {
            if fs::read_to_string(&pid_file).is_ok_and(|pid| !pid.trim().is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tokio::time::timeout(Duration::from_secs(10), coordinator.shutdown())
            .await
            .expect("shutdown must not wait for the tool to finish");

        let err = job.await.unwrap().unwrap_err();
        assert!(matches!(err, JobError::Execution(crate::error::RunError::Cancelled)));
        assert_eq!(
            lifecycle(&fx.remote),
            vec![
                EventType::Lock,
                EventType::Running,
                EventType::Failed,
                EventType::Unlock
            ]
        );
        assert!(coordinator.lock_state().is_ready());

        let pid = fs::read_to_string(&pid_file).unwrap();
        assert!(!std::path::Path::new(&format!("/proc/{}", pid.trim())).exists());
    }

    #[tokio::test]
    async fn test_no_job_starts_after_shutdown() {
        let fx = fixture("exit 0");
        fx.coordinator.shutdown().await;

        let err = fx.coordinator.run(&fx.job()).await.unwrap_err();

        assert!(matches!(err, JobError::Aborted(_)));
        assert!(fx.remote.events().is_empty());
    }

    #[tokio::test]
    async fn test_jobs_run_sequentially() {
        let fx = fixture("sleep 0.2\nexit 0");
        let second = Job::new(fx.tmp.path().join("case1").to_string_lossy()).with_output("OUT2");

        let first = fx.job();

        let (a, b) = tokio::join!(fx.coordinator.run(&first), fx.coordinator.run(&second));
        a.unwrap();
        b.unwrap();

        let types = lifecycle(&fx.remote);
        assert_eq!(types.len(), 8);
        // The second LOCK only follows the first UNLOCK.
        assert_eq!(
            &types[..4],
            &[
                EventType::Lock,
                EventType::Running,
                EventType::Done,
                EventType::Unlock
            ]
        );
        assert_eq!(types[4], EventType::Lock);
    }
}
