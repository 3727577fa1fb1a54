use crate::observability::EventKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Sdk,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub request_id: Option<String>,
    pub source: EventSource,
    pub protocol_version: u32,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            request_id: None,
            source: EventSource::Server,
            protocol_version: 1,
        }
    }
}

/// Payload carried by an `Event`. `Empty` covers signal-only events
/// (`task:unblocked`, `registry:changed`); `Json` covers everything whose
/// shape is determined by its kind rather than the Rust type system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    Json(Value),
}

impl EventPayload {
    pub fn as_json(&self) -> Value {
        match self {
            EventPayload::Empty => Value::Null,
            EventPayload::Json(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp_ms: i64,
    pub agent_id: Option<String>,
    pub channel_id: Option<String>,
    pub data: EventPayload,
    pub metadata: EventMetadata,
}

impl Event {
    pub fn new(kind: EventKind, data: EventPayload) -> Self {
        Self {
            kind,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            agent_id: None,
            channel_id: None,
            data,
            metadata: EventMetadata::default(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.request_id = Some(request_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_optional_fields() {
        let event = Event::new(EventKind::ToolCalled, EventPayload::Empty)
            .with_channel("general")
            .with_agent("agent-1")
            .with_request_id("req-1");

        assert_eq!(event.channel_id.as_deref(), Some("general"));
        assert_eq!(event.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(event.metadata.request_id.as_deref(), Some("req-1"));
    }
}
