//! Rate-limited, non-blocking event fan-out.
//!
//! The throttle drains an event channel and hands each event to a
//! [`Notifier`] on its own task:
//!
//! - lifecycle events are dispatched immediately, in submission order
//! - progress events are dispatched at most once per [`PROGRESS_WINDOW`];
//!   anything arriving inside the window is dropped, not queued
//! - at most `max_in_flight` deliveries run concurrently, so a slow or broken
//!   endpoint cannot grow the task set without bound
//!
//! Delivery failures are logged and counted, never returned to the producer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Event, Notifier};

/// Minimum spacing between two forwarded progress events.
pub const PROGRESS_WINDOW: Duration = Duration::from_secs(1);

/// Default bound on concurrently running deliveries.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Counters describing one throttle run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStats {
    /// Events read from the channel.
    pub received: u64,
    /// Events handed to the notifier.
    pub dispatched: u64,
    /// Progress events dropped inside the window.
    pub dropped: u64,
    /// Dispatched events whose delivery failed.
    pub failed: u64,
}

impl ThrottleStats {
    fn record(&mut self, outcome: Result<bool, JoinError>) {
        match outcome {
            Ok(true) => {}
            Ok(false) => self.failed += 1,
            Err(e) => {
                warn!(error = %e, "Event delivery task aborted");
                self.failed += 1;
            }
        }
    }
}

/// Forwards events to a notifier, throttling progress traffic.
#[derive(Clone)]
pub struct EventThrottle {
    notifier: Arc<dyn Notifier>,
    window: Duration,
    max_in_flight: usize,
}

impl EventThrottle {
    /// Creates a throttle with the default window and in-flight bound.
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            window: PROGRESS_WINDOW,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Sets the progress window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Sets the bound on concurrent deliveries (at least one).
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Spawns the throttle on the runtime and returns its input channel.
    ///
    /// The task finishes once every sender is dropped and all pending
    /// deliveries have completed.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<Event>, JoinHandle<ThrottleStats>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(self.run(rx));
        (tx, handle)
    }

    /// Consumes events until the channel is closed, then waits for
    /// in-flight deliveries.
    pub async fn run(self, mut events: mpsc::Receiver<Event>) -> ThrottleStats {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut deliveries = JoinSet::new();
        let mut last_progress: Option<Instant> = None;
        let mut stats = ThrottleStats::default();

        while let Some(event) = events.recv().await {
            stats.received += 1;

            if event.event_type.is_progress() {
                let now = Instant::now();
                if let Some(last) = last_progress {
                    if now.duration_since(last) < self.window {
                        stats.dropped += 1;
                        continue;
                    }
                }
                last_progress = Some(now);
            }

            while let Some(outcome) = deliveries.try_join_next() {
                stats.record(outcome);
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let notifier = Arc::clone(&self.notifier);
            stats.dispatched += 1;
            deliveries.spawn(async move {
                let _permit = permit;
                match notifier.notify(&event).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            event_type = %event.event_type,
                            evidence = %event.payload.evidence_path,
                            error = %e,
                            "Failed to deliver event"
                        );
                        false
                    }
                }
            });
        }

        while let Some(outcome) = deliveries.join_next().await {
            stats.record(outcome);
        }

        debug!(
            received = stats.received,
            dispatched = stats.dispatched,
            dropped = stats.dropped,
            failed = stats.failed,
            "Event throttle drained"
        );

        stats
    }
}
