//! Distributed lock over the worker's single execution slot.
//!
//! Two layers cooperate:
//!
//! - a local slot (`tokio::sync::Mutex<ExecutionContext>`) that serializes
//!   jobs inside this process and owns the running tool, that is the child
//!   process and its audit log writer;
//! - a remote lock service that is told `LOCK`/`UNLOCK` so the fleet knows
//!   which evidence this worker holds.
//!
//! The held evidence path is mirrored in a [`LockState`] readable at any
//! time; a non-empty value means "busy".

use std::io;
use std::sync::{Arc, RwLock};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{LockError, RunError};
use crate::events::{Event, EventType, Notifier};
use crate::runner::RunningTool;

/// Resources only the job holding the slot may touch.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    tool: Option<RunningTool>,
}

impl ExecutionContext {
    /// Takes ownership of a freshly spawned tool.
    pub fn attach(&mut self, tool: RunningTool) {
        self.tool = Some(tool);
    }

    /// Whether a tool is attached.
    pub fn is_running(&self) -> bool {
        self.tool.is_some()
    }

    pub fn tool_mut(&mut self) -> Option<&mut RunningTool> {
        self.tool.as_mut()
    }

    /// Waits for the attached tool, then detaches it.
    pub async fn wait_tool(&mut self, cancel: &CancellationToken) -> Result<(), RunError> {
        let Some(tool) = self.tool.as_mut() else {
            return Err(RunError::Wait(io::Error::new(
                io::ErrorKind::NotFound,
                "no tool attached",
            )));
        };
        let result = tool.wait(cancel).await;
        self.tool = None;
        result
    }

    /// Drops the attached tool, killing it if it is still running.
    fn clear(&mut self) -> bool {
        self.tool.take().is_some()
    }
}

/// Process-wide record of the evidence currently holding the lock.
#[derive(Debug, Clone, Default)]
pub struct LockState {
    held: Arc<RwLock<Option<String>>>,
}

impl LockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evidence currently holding the lock.
    pub fn held_evidence(&self) -> Option<String> {
        self.held
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Readiness signal: true when no job holds the lock.
    pub fn is_ready(&self) -> bool {
        self.held_evidence().is_none()
    }

    fn set(&self, evidence: Option<String>) {
        *self
            .held
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = evidence;
    }
}

/// Claims and releases the execution slot.
#[derive(Clone)]
pub struct DistributedLock {
    slot: Arc<Mutex<ExecutionContext>>,
    state: LockState,
    remote: Arc<dyn Notifier>,
}

impl DistributedLock {
    /// Creates a lock that reports to `remote`.
    pub fn new(remote: Arc<dyn Notifier>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(ExecutionContext::default())),
            state: LockState::new(),
            remote,
        }
    }

    /// Shared readiness state.
    pub fn state(&self) -> &LockState {
        &self.state
    }

    /// Waits for the local slot, records `evidence` and announces `LOCK`.
    ///
    /// If the remote service rejects the claim, the state is cleared and the
    /// slot is released before the error is returned.
    pub async fn acquire(&self, evidence: &str) -> Result<LockGuard, LockError> {
        let context = Arc::clone(&self.slot).lock_owned().await;
        self.claim(context, evidence).await
    }

    /// Like [`DistributedLock::acquire`], but stops waiting for the slot
    /// once `cancel` fires.
    pub async fn acquire_until(
        &self,
        evidence: &str,
        cancel: &CancellationToken,
    ) -> Result<LockGuard, LockError> {
        let context = tokio::select! {
            context = Arc::clone(&self.slot).lock_owned() => context,
            _ = cancel.cancelled() => {
                return Err(LockError::Cancelled {
                    evidence: evidence.to_string(),
                });
            }
        };
        self.claim(context, evidence).await
    }

    async fn claim(
        &self,
        context: OwnedMutexGuard<ExecutionContext>,
        evidence: &str,
    ) -> Result<LockGuard, LockError> {
        self.state.set(Some(evidence.to_string()));

        if let Err(source) = self.remote.notify(&Event::new(EventType::Lock, evidence)).await {
            self.state.set(None);
            warn!(evidence, error = %source, "Remote lock rejected");
            return Err(LockError::Acquire {
                evidence: evidence.to_string(),
                source,
            });
        }

        info!(evidence, "Lock acquired");
        Ok(LockGuard {
            context: Some(context),
            evidence: evidence.to_string(),
            state: self.state.clone(),
            remote: Arc::clone(&self.remote),
        })
    }
}

/// Proof of holding the execution slot.
///
/// Call [`LockGuard::release`] to announce `UNLOCK`. If the guard is dropped
/// without being released (a panic unwinding through the coordinator), the
/// state is still cleared and `UNLOCK` is sent from a background task.
pub struct LockGuard {
    context: Option<OwnedMutexGuard<ExecutionContext>>,
    evidence: String,
    state: LockState,
    remote: Arc<dyn Notifier>,
}

impl LockGuard {
    /// Evidence this guard holds the lock for.
    pub fn evidence(&self) -> &str {
        &self.evidence
    }

    /// Slot-guarded execution context.
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        self.context
            .as_deref_mut()
            .expect("context is present until release")
    }

    /// Announces `UNLOCK`, then clears the state and frees the slot.
    ///
    /// Local cleanup happens whatever the remote answers; a rejected unlock
    /// is returned only for reporting.
    pub async fn release(mut self) -> Result<(), LockError> {
        let result = self
            .remote
            .notify(&Event::new(EventType::Unlock, self.evidence.as_str()))
            .await;

        self.clear();

        match result {
            Ok(()) => {
                info!(evidence = %self.evidence, "Lock released");
                Ok(())
            }
            Err(source) => {
                error!(evidence = %self.evidence, error = %source, "Remote unlock failed");
                Err(LockError::Release {
                    evidence: self.evidence.clone(),
                    source,
                })
            }
        }
    }

    fn clear(&mut self) {
        if let Some(mut context) = self.context.take() {
            if context.clear() {
                warn!(evidence = %self.evidence, "Tool still attached at release, killed");
            }
            self.state.set(None);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.context.is_none() {
            return;
        }
        self.clear();

        warn!(evidence = %self.evidence, "Lock guard dropped without release");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let remote = Arc::clone(&self.remote);
            let event = Event::new(EventType::Unlock, self.evidence.as_str());
            handle.spawn(async move {
                if let Err(e) = remote.notify(&event).await {
                    error!(error = %e, "Remote unlock failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingNotifier;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_release_round_trip() {
        let remote = RecordingNotifier::new();
        let lock = DistributedLock::new(Arc::new(remote.clone()));

        let guard = lock.acquire("/data/case1").await.unwrap();
        assert_eq!(
            lock.state().held_evidence(),
            Some("/data/case1".to_string())
        );
        assert!(!lock.state().is_ready());

        guard.release().await.unwrap();
        assert!(lock.state().is_ready());
        assert_eq!(remote.types(), vec![EventType::Lock, EventType::Unlock]);
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_state_empty() {
        let remote = RecordingNotifier::rejecting(EventType::Lock);
        let lock = DistributedLock::new(Arc::new(remote.clone()));

        let err = lock.acquire("/data/case1").await.err().unwrap();
        assert!(matches!(err, LockError::Acquire { .. }));
        assert!(lock.state().is_ready());

        // The slot was released with the rollback.
        remote.accept_all();
        let guard = tokio::time::timeout(Duration::from_secs(1), lock.acquire("/data/case2"))
            .await
            .expect("slot should be free")
            .unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_release_still_clears_state() {
        let remote = RecordingNotifier::rejecting(EventType::Unlock);
        let lock = DistributedLock::new(Arc::new(remote.clone()));

        let guard = lock.acquire("/data/case1").await.unwrap();
        assert!(matches!(
            guard.release().await,
            Err(LockError::Release { .. })
        ));
        assert!(lock.state().is_ready());
        assert_eq!(remote.count(EventType::Unlock), 1);
    }

    #[tokio::test]
    async fn test_second_acquire_waits_for_release() {
        let remote = RecordingNotifier::new();
        let lock = DistributedLock::new(Arc::new(remote.clone()));

        let first = lock.acquire("/data/one").await.unwrap();
        let waiting = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("/data/two").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        assert_eq!(lock.state().held_evidence(), Some("/data/one".to_string()));

        first.release().await.unwrap();
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(second.evidence(), "/data/two");
        second.release().await.unwrap();

        assert_eq!(
            remote.types(),
            vec![
                EventType::Lock,
                EventType::Unlock,
                EventType::Lock,
                EventType::Unlock
            ]
        );
    }

    #[tokio::test]
    async fn test_dropped_guard_unlocks() {
        let remote = RecordingNotifier::new();
        let lock = DistributedLock::new(Arc::new(remote.clone()));

        let guard = lock.acquire("/data/case1").await.unwrap();
        drop(guard);
        assert!(lock.state().is_ready());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.count(EventType::Unlock), 1);

        let mut next = lock.acquire("/data/case2").await.unwrap();
        assert!(!next.context_mut().is_running());
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_wait_gives_up_slot() {
        let remote = RecordingNotifier::new();
        let lock = DistributedLock::new(Arc::new(remote.clone()));
        let cancel = CancellationToken::new();

        let first = lock.acquire("/data/one").await.unwrap();
        let waiting = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire_until("/data/two", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = waiting.await.unwrap().err().unwrap();
        assert!(matches!(err, LockError::Cancelled { ref evidence } if evidence == "/data/two"));
        assert_eq!(lock.state().held_evidence(), Some("/data/one".to_string()));

        first.release().await.unwrap();
        assert_eq!(remote.types(), vec![EventType::Lock, EventType::Unlock]);
    }

    #[tokio::test]
    async fn test_wait_without_tool_fails() {
        let mut context = ExecutionContext::default();
        let err = context.wait_tool(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Wait(_)));
    }
}
