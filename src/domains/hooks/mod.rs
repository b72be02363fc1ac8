pub mod server;

use crate::errors::CoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use server::HookServer;

/// Lifecycle callbacks posted by tooling running inside a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEventKind {
    AgentStarted,
    ToolUse,
    WaitingInput,
    AgentStopped,
    Notification,
}

/// Wire shape of a hook callback: `{correlationToken, eventKind, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookRequest {
    pub correlation_token: String,
    pub event_kind: HookEventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A correlated callback, stamped at receipt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    pub correlation_token: String,
    pub kind: HookEventKind,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl HookEvent {
    pub fn from_request(request: HookRequest) -> Self {
        Self {
            correlation_token: request.correlation_token,
            kind: request.event_kind,
            payload: request.payload,
            received_at: Utc::now(),
        }
    }
}

/// Consumer of resolved hook events; implemented by the session registry.
/// A `CorrelationMiss` from the sink is logged by the server and never
/// surfaced to the sender.
#[async_trait]
pub trait HookSink: Send + Sync {
    async fn deliver(&self, event: HookEvent) -> Result<(), CoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_wire_shape() {
        let raw = r#"{"correlationToken":"abc123","eventKind":"waiting-input","payload":{"prompt":"continue?"}}"#;
        let request: HookRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.correlation_token, "abc123");
        assert_eq!(request.event_kind, HookEventKind::WaitingInput);
        assert_eq!(request.payload["prompt"], "continue?");
    }

    #[test]
    fn payload_defaults_to_null_when_absent() {
        let raw = r#"{"correlationToken":"abc123","eventKind":"tool-use"}"#;
        let request: HookRequest = serde_json::from_str(raw).unwrap();
        assert!(request.payload.is_null());
    }

    #[test]
    fn event_is_stamped_at_receipt() {
        let before = Utc::now();
        let event = HookEvent::from_request(HookRequest {
            correlation_token: "t".into(),
            event_kind: HookEventKind::AgentStarted,
            payload: serde_json::Value::Null,
        });
        assert!(event.received_at >= before);
    }
}
