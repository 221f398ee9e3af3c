//! Delivery of enriched events to the telemetry backend.
//!
//! The batcher only sees the [`Transport`] trait. [`HttpTransport`] is the
//! production implementation; tests substitute their own.

use crate::errors::TransportError;
use crate::event::{OutgoingEvent, Properties};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tool name the ToolBridge `/call` endpoint dispatches on.
pub const TRACK_TOOL: &str = "trackEvent";

/// Sends a single event. One call per event; the batcher runs them concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, event: &OutgoingEvent) -> Result<(), TransportError>;
}

/// Which backend route receives events.
///
/// | Variant | Route         | Body                                                          |
/// |---------|---------------|---------------------------------------------------------------|
/// | `Call`  | `POST /call`  | `{"tool":"trackEvent","input":{"event","properties"},"userId"}` |
/// | `Event` | `POST /event` | `{"event","properties","userId"}`                             |
/// | `Track` | `POST /track` | `{"event","properties","userId"}`                             |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    #[default]
    Call,
    Event,
    Track,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Call => "call",
            Endpoint::Event => "event",
            Endpoint::Track => "track",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('/').to_lowercase().as_str() {
            "call" => Ok(Endpoint::Call),
            "event" => Ok(Endpoint::Event),
            "track" => Ok(Endpoint::Track),
            _ => anyhow::bail!("Invalid endpoint '{}'. Valid values: call, event, track", s),
        }
    }
}

/// Body of `POST /call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    pub input: TrackInput,
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// `input` of a `trackEvent` tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackInput {
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
}

impl ToolCall {
    pub fn track(event: &OutgoingEvent) -> Self {
        Self {
            tool: TRACK_TOOL.to_string(),
            input: TrackInput {
                event: event.event.clone(),
                properties: event.properties.clone(),
            },
            user_id: event.user_id.clone(),
        }
    }
}

/// Render the JSON body for an endpoint.
pub fn request_body(
    endpoint: Endpoint,
    event: &OutgoingEvent,
) -> Result<serde_json::Value, TransportError> {
    match endpoint {
        Endpoint::Call => serde_json::to_value(ToolCall::track(event)),
        Endpoint::Event | Endpoint::Track => serde_json::to_value(event),
    }
    .map_err(TransportError::Encode)
}

/// POSTs each event as JSON with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    endpoint: Endpoint,
}

impl HttpTransport {
    pub fn new(base_url: &str, endpoint: Endpoint, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self::with_client(client, base_url, endpoint))
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, endpoint: Endpoint) -> Self {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), endpoint.path());
        Self {
            client,
            url,
            endpoint,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, event: &OutgoingEvent) -> Result<(), TransportError> {
        let body = request_body(self.endpoint, event)?;
        let resp = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(TransportError::Status {
                status: resp.status().as_u16(),
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OutgoingEvent {
        let mut properties = Properties::new();
        properties.insert("plan".into(), "pro".into());
        OutgoingEvent {
            event: "upgrade".into(),
            properties,
            user_id: "anon-1".into(),
        }
    }

    #[test]
    fn test_call_body_wraps_in_tool_envelope() {
        let body = request_body(Endpoint::Call, &sample()).unwrap();
        assert_eq!(body["tool"], "trackEvent");
        assert_eq!(body["input"]["event"], "upgrade");
        assert_eq!(body["input"]["properties"]["plan"], "pro");
        assert_eq!(body["userId"], "anon-1");
    }

    #[test]
    fn test_flat_body_for_event_and_track() {
        for endpoint in [Endpoint::Event, Endpoint::Track] {
            let body = request_body(endpoint, &sample()).unwrap();
            assert_eq!(body["event"], "upgrade");
            assert_eq!(body["userId"], "anon-1");
            assert!(body.get("tool").is_none());
        }
    }

    #[test]
    fn test_url_joins_base_and_endpoint() {
        let t = HttpTransport::new("http://127.0.0.1:3030/", Endpoint::Call, Duration::from_secs(1))
            .unwrap();
        assert_eq!(t.url(), "http://127.0.0.1:3030/call");

        let t = HttpTransport::new(
            "http://localhost:8080/api",
            Endpoint::Track,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(t.url(), "http://localhost:8080/api/track");
    }

    #[test]
    fn test_endpoint_from_str() {
        assert_eq!("call".parse::<Endpoint>().unwrap(), Endpoint::Call);
        assert_eq!("/track".parse::<Endpoint>().unwrap(), Endpoint::Track);
        assert_eq!("EVENT".parse::<Endpoint>().unwrap(), Endpoint::Event);
        assert!("send".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_a_transport_error() {
        // Port 9 (discard) on localhost is almost never listening.
        let t = HttpTransport::new("http://127.0.0.1:9", Endpoint::Call, Duration::from_millis(500))
            .unwrap();
        let result = t.send(&sample()).await;
        assert!(result.is_err());
    }
}
