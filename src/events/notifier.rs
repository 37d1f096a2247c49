//! Event delivery to remote HTTP endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::Event;
use crate::error::NotifyError;

/// Default timeout for a single notification request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Something that can deliver an [`Event`].
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event. Stateless and synchronous per call.
    async fn notify(&self, event: &Event) -> Result<(), NotifyError>;
}

/// Posts events as JSON to a fixed URL.
///
/// Any non-2xx response is a delivery failure.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    url: String,
    http_client: Client,
}

impl HttpNotifier {
    /// Creates a notifier for `url` with the default request timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Creates a notifier for `url` with a custom request timeout.
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            url: url.into(),
            http_client,
        }
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, event: &Event) -> Result<(), NotifyError> {
        debug!(
            url = %self.url,
            event_type = %event.event_type,
            evidence = %event.payload.evidence_path,
            "Sending event"
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::RequestFailed {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "Response from remote endpoint not ok");
            return Err(NotifyError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[test]
    fn test_notifier_url() {
        let notifier = HttpNotifier::new("http://locker.local/lock");
        assert_eq!(notifier.url(), "http://locker.local/lock");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_failure() {
        // Port 9 (discard) on localhost is not expected to accept HTTP.
        let notifier =
            HttpNotifier::with_timeout("http://127.0.0.1:9/events", Duration::from_millis(500));
        let result = notifier
            .notify(&Event::new(EventType::Running, "/data/case1"))
            .await;
        assert!(matches!(result, Err(NotifyError::RequestFailed { .. })));
    }
}
