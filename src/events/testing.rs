//! Notifier doubles shared by unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Event, EventType, Notifier};
use crate::error::NotifyError;

/// Records every delivery attempt; optionally rejects some event types.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<Event>>>,
    reject: Arc<Mutex<HashSet<EventType>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every event of `event_type` with a 500 status.
    pub fn rejecting(event_type: EventType) -> Self {
        let notifier = Self::new();
        notifier.reject(event_type);
        notifier
    }

    pub fn reject(&self, event_type: EventType) {
        self.reject.lock().unwrap().insert(event_type);
    }

    pub fn accept_all(&self) {
        self.reject.lock().unwrap().clear();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type).collect()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.types().iter().filter(|t| **t == event_type).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        if self.reject.lock().unwrap().contains(&event.event_type) {
            return Err(NotifyError::Status {
                url: "test://recording".to_string(),
                status: 500,
            });
        }
        Ok(())
    }
}
