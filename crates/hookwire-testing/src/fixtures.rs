//! Test data builders with sensible defaults.

use std::time::Duration;

use hookwire_core::models::{Endpoint, Event, HttpMethod, RetryConfig, WorkspaceId};
use serde_json::{json, Value};

/// Builder for test endpoints.
///
/// Defaults to an enabled POST endpoint subscribed to `order.created`, with
/// an immediate first attempt and two retries.
#[derive(Debug, Clone)]
pub struct EndpointBuilder {
    workspace_id: WorkspaceId,
    url: String,
    events: Vec<String>,
    retry: Vec<u64>,
    method: HttpMethod,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    enabled: bool,
}

impl EndpointBuilder {
    /// Creates a builder targeting `url`.
    pub fn new(workspace_id: WorkspaceId, url: impl Into<String>) -> Self {
        Self {
            workspace_id,
            url: url.into(),
            events: vec!["order.created".to_string()],
            retry: vec![0, 60, 300],
            method: HttpMethod::Post,
            headers: Vec::new(),
            timeout: None,
            enabled: true,
        }
    }

    /// Replaces the subscribed event types.
    #[must_use]
    pub fn events(mut self, events: &[&str]) -> Self {
        self.events = events.iter().map(|e| (*e).to_string()).collect();
        self
    }

    /// Sets the retry offsets in seconds.
    #[must_use]
    pub fn retry(mut self, attempts: &[u64]) -> Self {
        self.retry = attempts.to_vec();
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Adds a configured request header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the endpoint disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Builds the endpoint.
    pub fn build(self) -> Endpoint {
        let mut endpoint = Endpoint::new(self.workspace_id, self.url);
        endpoint.events = self.events;
        endpoint.retry = RetryConfig::fixed(self.retry);
        endpoint.enabled = self.enabled;
        endpoint.request.method = self.method;
        endpoint.request.headers.extend(self.headers);
        if let Some(timeout) = self.timeout {
            endpoint.request.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        }
        endpoint
    }
}

/// Builder for test events.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event_type: String,
    data: Value,
    unique_id: Option<String>,
}

impl EventBuilder {
    /// `order.created` with a small JSON body.
    pub fn new() -> Self {
        Self {
            event_type: "order.created".to_string(),
            data: json!({"order_id": 1}),
            unique_id: None,
        }
    }

    /// Sets the event type.
    #[must_use]
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Sets the JSON payload.
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Sets the deduplication key.
    #[must_use]
    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Builds the event. The workspace is stamped at dispatch.
    pub fn build(self) -> Event {
        let event = Event::new(self.event_type, self.data);
        match self.unique_id {
            Some(unique_id) => event.with_unique_id(unique_id),
            None => event,
        }
    }
}

impl Default for EventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_builder_applies_overrides() {
        let endpoint = EndpointBuilder::new(WorkspaceId::new(), "https://example.com/hook")
            .events(&["a", "b"])
            .retry(&[5])
            .method(HttpMethod::Put)
            .header("x-key", "v")
            .timeout(Duration::from_millis(250))
            .disabled()
            .build();

        assert_eq!(endpoint.events, vec!["a", "b"]);
        assert_eq!(endpoint.retry.attempts, vec![5]);
        assert_eq!(endpoint.request.method, HttpMethod::Put);
        assert_eq!(endpoint.request.headers.get("x-key").map(String::as_str), Some("v"));
        assert_eq!(endpoint.request.timeout_ms, 250);
        assert!(!endpoint.enabled);
    }

    #[test]
    fn event_builder_sets_unique_id() {
        let event = EventBuilder::new().event_type("user.created").unique_id("u-1").build();
        assert_eq!(event.event_type, "user.created");
        assert_eq!(event.unique_id.as_deref(), Some("u-1"));
    }
}
