//! Job events and their delivery.
//!
//! Every observable step of a job is an [`Event`]: lock claims, lifecycle
//! transitions and progress lines scraped from the tool's output. Events are
//! posted as JSON to remote endpoints by a [`Notifier`]; progress traffic is
//! rate-limited by the [`EventThrottle`].
//!
//! # Wire format
//!
//! ```text
//! POST <url>
//! {"type": "progress", "payload": {"evidencePath": "/data/case1", "progress": "..."}}
//! ```

pub mod notifier;
pub mod throttle;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use notifier::{HttpNotifier, Notifier};
pub use throttle::{EventThrottle, ThrottleStats, DEFAULT_MAX_IN_FLIGHT, PROGRESS_WINDOW};

/// Kind of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Claim of the shared execution slot.
    #[serde(rename = "LOCK")]
    Lock,
    /// Release of the shared execution slot.
    #[serde(rename = "UNLOCK")]
    Unlock,
    /// The tool has been spawned.
    #[serde(rename = "running")]
    Running,
    /// A line of tool output carrying progress.
    #[serde(rename = "progress")]
    Progress,
    /// The job finished successfully.
    #[serde(rename = "done")]
    Done,
    /// The job failed.
    #[serde(rename = "failed")]
    Failed,
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Lock => "LOCK",
            EventType::Unlock => "UNLOCK",
            EventType::Running => "running",
            EventType::Progress => "progress",
            EventType::Done => "done",
            EventType::Failed => "failed",
        }
    }

    /// Lifecycle events are never throttled.
    pub fn is_progress(&self) -> bool {
        matches!(self, EventType::Progress)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload carried by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Evidence the event refers to.
    pub evidence_path: String,
    /// Free-form progress text (a log line, or a failure reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<String>,
}

/// A single notification, transient between producer and notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: EventPayload,
}

impl Event {
    /// Creates an event without progress text.
    pub fn new(event_type: EventType, evidence_path: impl Into<String>) -> Self {
        Self {
            event_type,
            payload: EventPayload {
                evidence_path: evidence_path.into(),
                progress: None,
            },
        }
    }

    /// Creates a progress event for one line of tool output.
    pub fn progress(evidence_path: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EventType::Progress, evidence_path).with_progress(text)
    }

    /// Attaches progress text.
    pub fn with_progress(mut self, text: impl Into<String>) -> Self {
        self.payload.progress = Some(text.into());
        self
    }

    /// Returns the progress text, if any.
    pub fn progress_text(&self) -> Option<&str> {
        self.payload.progress.as_deref()
    }
}
