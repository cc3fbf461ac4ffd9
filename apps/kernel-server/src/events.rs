// [[CONDUIT]]/apps/kernel-server/src/events.rs
// Purpose: Event definitions for conversation scopes (user, agent and system traffic).
// Architecture: Domain Event Layer
// Dependencies: Serde, Chrono

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Chat text from the user or the agent
    Message,
    /// Result of a tool call or other agent-side effect
    Observation,
    /// Lifecycle change of the session (running, finished, stopped...)
    AgentStateUpdate,
    Error,
    /// Greeting sent to a freshly connected stream client. Never persisted.
    ConnectionEstablished,
}

/// An event before the log has assigned it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub source: EventSource,
    pub kind: EventKind,
    pub payload: Value,
}

impl EventDraft {
    pub fn new(source: EventSource, kind: EventKind, payload: Value) -> Self {
        Self { source, kind, payload }
    }

    pub fn agent_state(state: &str, task_id: &str) -> Self {
        Self::new(
            EventSource::System,
            EventKind::AgentStateUpdate,
            serde_json::json!({ "agent_state": state, "task_id": task_id }),
        )
    }
}

/// A persisted event. `id` is unique and gap-free within `scope`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub scope: String,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    /// Milliseconds since epoch
    pub timestamp: i64,
}

impl Event {
    pub fn from_draft(id: i64, scope: &str, draft: EventDraft, timestamp: i64) -> Self {
        Self {
            id,
            scope: scope.to_string(),
            source: draft.source,
            kind: draft.kind,
            payload: draft.payload,
            timestamp,
        }
    }
}

/// Serialized form of an event minus its id. Stores that assign ids server-side splice the id in.
#[derive(Debug, Serialize)]
pub(crate) struct EventBody<'a> {
    pub scope: &'a str,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: &'a Value,
    pub timestamp: i64,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
