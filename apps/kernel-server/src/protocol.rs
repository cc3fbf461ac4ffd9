// [[CONDUIT]]/apps/kernel-server/src/protocol.rs
// Purpose: Socket.IO-compatible text framing for the conversation stream.
// Architecture: Transport Layer
// Dependencies: Serde JSON

use serde_json::{json, Value};

use crate::error::{KernelError, KernelResult};
use crate::events::{now_millis, Event};

pub const PING: &str = "2";
pub const PONG: &str = "3";
/// Engine.IO "message" + Socket.IO "event"
const EVENT_PREFIX: &str = "42";
/// Socket.IO namespace connect, sent by some clients after the handshake
const CONNECT: &str = "40";

pub const USER_ACTION_EVENT: &str = "oh_user_action";
pub const OUTBOUND_EVENT: &str = "oh_event";

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Ping,
    Pong,
    Connect,
    Event { name: String, payload: Value },
}

pub fn parse_frame(text: &str) -> KernelResult<InboundFrame> {
    let text = text.trim();
    match text {
        PING => return Ok(InboundFrame::Ping),
        PONG => return Ok(InboundFrame::Pong),
        CONNECT => return Ok(InboundFrame::Connect),
        _ => {}
    }

    let body = text
        .strip_prefix(EVENT_PREFIX)
        .ok_or_else(|| KernelError::Transport(format!("unknown packet type in {:?}", truncate(text))))?;

    let parts: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| KernelError::Transport(format!("event body is not a JSON array: {}", e)))?;

    let mut parts = parts.into_iter();
    let name = match parts.next() {
        Some(Value::String(name)) => name,
        _ => return Err(KernelError::Transport("event name must be a string".to_string())),
    };
    let payload = parts.next().unwrap_or(Value::Null);

    Ok(InboundFrame::Event { name, payload })
}

pub fn encode_event(name: &str, payload: &Value) -> String {
    format!("{}{}", EVENT_PREFIX, json!([name, payload]))
}

pub fn encode_stored(event: &Event) -> String {
    // Event always serializes; fall back to an empty object rather than dropping the frame.
    let payload = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    encode_event(OUTBOUND_EVENT, &payload)
}

pub fn connection_established(client_id: &str, conversation_id: &str) -> String {
    encode_event(
        OUTBOUND_EVENT,
        &json!({
            "type": "connection_established",
            "source": "system",
            "client_id": client_id,
            "conversation_id": conversation_id,
            "timestamp": now_millis(),
        }),
    )
}

/// Transient error for one client; not written to the event log.
pub fn error_frame(message: &str) -> String {
    encode_event(
        OUTBOUND_EVENT,
        &json!({
            "type": "error",
            "source": "system",
            "message": message,
            "timestamp": now_millis(),
        }),
    )
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(32) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Payload of an `oh_user_action` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    Message { content: String, payload: Value },
    AgentStateChange { agent_state: String, payload: Value },
    /// Anything else is handed to the session untouched.
    Forward { action: String, payload: Value },
}

impl UserAction {
    /// Reads the discriminator from `type` (or `action`), with arguments either inline or under `args`.
    pub fn parse(payload: Value) -> KernelResult<Self> {
        if !payload.is_object() {
            return Err(KernelError::Transport("user action must be a JSON object".to_string()));
        }

        let kind = payload
            .get("type")
            .or_else(|| payload.get("action"))
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::Transport("user action has no type".to_string()))?
            .to_string();

        let field = |name: &str| {
            payload
                .get(name)
                .or_else(|| payload.get("args").and_then(|a| a.get(name)))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        match kind.as_str() {
            "message" => {
                let content = field("content").unwrap_or_default();
                Ok(UserAction::Message { content, payload })
            }
            "agent_state_change" | "change_agent_state" => {
                let agent_state = field("agent_state")
                    .ok_or_else(|| KernelError::Transport("agent_state_change without agent_state".to_string()))?;
                Ok(UserAction::AgentStateChange { agent_state, payload })
            }
            _ => Ok(UserAction::Forward { action: kind, payload }),
        }
    }

    pub fn payload(&self) -> &Value {
        match self {
            UserAction::Message { payload, .. }
            | UserAction::AgentStateChange { payload, .. }
            | UserAction::Forward { payload, .. } => payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDraft, EventKind, EventSource};

    #[test]
    fn ping_and_pong_are_single_characters() {
        assert_eq!(parse_frame("2").expect("ping"), InboundFrame::Ping);
        assert_eq!(parse_frame("3").expect("pong"), InboundFrame::Pong);
        assert_eq!(PONG, "3");
    }

    #[test]
    fn parses_named_event() {
        let frame = parse_frame(r#"42["oh_user_action",{"type":"message","content":"hi"}]"#).expect("frame");
        match frame {
            InboundFrame::Event { name, payload } => {
                assert_eq!(name, USER_ACTION_EVENT);
                assert_eq!(payload["content"], "hi");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_are_transport_errors() {
        for bad in ["42[oops", "42{\"a\":1}", "42[1,2]", "9xyz", ""] {
            let err = parse_frame(bad).expect_err(bad);
            assert!(matches!(err, KernelError::Transport(_)), "{bad}: {err:?}");
        }
    }

    #[test]
    fn encodes_stored_event_as_oh_event() {
        let event = Event::from_draft(
            1,
            "conv",
            EventDraft::new(EventSource::Agent, EventKind::Message, json!({"content": "hello"})),
            5,
        );
        let frame = encode_stored(&event);
        assert!(frame.starts_with("42[\"oh_event\","));
        match parse_frame(&frame).expect("round trip") {
            InboundFrame::Event { payload, .. } => {
                assert_eq!(payload["id"], 1);
                assert_eq!(payload["type"], "message");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn user_actions_by_type() {
        let msg = UserAction::parse(json!({"type": "message", "content": "hi"})).expect("message");
        assert!(matches!(msg, UserAction::Message { ref content, .. } if content == "hi"));

        let legacy = UserAction::parse(json!({"action": "message", "args": {"content": "yo"}})).expect("legacy");
        assert!(matches!(legacy, UserAction::Message { ref content, .. } if content == "yo"));

        let stop = UserAction::parse(json!({"type": "agent_state_change", "agent_state": "stopped"}))
            .expect("state change");
        assert!(matches!(stop, UserAction::AgentStateChange { ref agent_state, .. } if agent_state == "stopped"));

        let run = UserAction::parse(json!({"type": "run", "args": {"command": "ls"}})).expect("forward");
        assert!(matches!(run, UserAction::Forward { ref action, .. } if action == "run"));

        assert!(UserAction::parse(json!({"content": "no type"})).is_err());
        assert!(UserAction::parse(json!("message")).is_err());
    }
}
