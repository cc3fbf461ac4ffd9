// [[CONDUIT]]/apps/kernel-server/src/server/socket.rs
// Purpose: Socket.IO-framed conversation stream. Catch-up, then live events; user actions in.
// Architecture: API Layer
// Dependencies: Axum (ws), futures, Tokio

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use std::sync::Arc;
use tokio::time::Instant;

use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventDraft, EventKind, EventSource};
use crate::hub::{Admit, Connection, ReplayCursor};
use crate::protocol::{self, InboundFrame, UserAction};
use crate::server::KernelState;

const DEFAULT_CONVERSATION: &str = "default";

#[derive(Debug, serde::Deserialize)]
pub struct StreamParams {
    conversation_id: Option<String>,
    latest_event_id: Option<i64>,
}

pub async fn ws_conversation_stream(
    State(state): State<Arc<KernelState>>,
    Query(params): Query<StreamParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let conversation_id = params
        .conversation_id
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CONVERSATION.to_string());
    let latest_event_id = params.latest_event_id.unwrap_or(-1);

    ws.on_upgrade(move |socket| handle_conversation_stream(socket, state, conversation_id, latest_event_id))
}

type WsSink = SplitSink<WebSocket, Message>;

/// Writes one text frame, bounded by the configured write timeout.
async fn send_text(sender: &mut WsSink, state: &KernelState, text: String) -> KernelResult<()> {
    match tokio::time::timeout(state.config.ws_write_timeout, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(KernelError::Transport(format!("send failed: {}", e))),
        Err(_) => Err(KernelError::Transport("send timed out".to_string())),
    }
}

/// Sends `event` if the cursor admits it; on a gap, re-reads the missing range from the log first.
async fn deliver(
    sender: &mut WsSink,
    state: &KernelState,
    cursor: &mut ReplayCursor,
    event: Event,
) -> KernelResult<()> {
    match cursor.admit(event.id) {
        Admit::Skip => Ok(()),
        Admit::Deliver => {
            send_text(sender, state, protocol::encode_stored(&event)).await?;
            cursor.advance(event.id);
            Ok(())
        }
        Admit::Gap(after) => {
            tracing::debug!("Gap after {} on {}; replaying from log", after, event.scope);
            fill_from_log(sender, state, cursor, &event.scope, after).await
        }
    }
}

/// Sends every stored event after `after` that the cursor still admits.
async fn fill_from_log(
    sender: &mut WsSink,
    state: &KernelState,
    cursor: &mut ReplayCursor,
    scope: &str,
    after: i64,
) -> KernelResult<()> {
    let missing = match state.events.read_since(scope, after).await {
        Ok(missing) => missing,
        Err(e) => {
            // Can't fill the hole; hold position so the next delivery retries.
            let _ = send_text(sender, state, protocol::error_frame(&e.to_string())).await;
            return Ok(());
        }
    };
    for e in missing {
        if cursor.admit(e.id) == Admit::Deliver {
            send_text(sender, state, protocol::encode_stored(&e)).await?;
            cursor.advance(e.id);
        }
    }
    Ok(())
}

/// Recovers from dropped live events: drains what is buffered, then re-reads the rest.
async fn resync(
    sender: &mut WsSink,
    state: &KernelState,
    cursor: &mut ReplayCursor,
    connection: &mut Connection,
) -> KernelResult<()> {
    while let Ok(event) = connection.events.try_recv() {
        deliver(sender, state, cursor, event).await?;
    }
    match cursor.last() {
        Some(last) => fill_from_log(sender, state, cursor, &connection.scope, last).await,
        // Live-only client with no baseline yet; it never asked for history.
        None => Ok(()),
    }
}

async fn handle_conversation_stream(
    socket: WebSocket,
    state: Arc<KernelState>,
    conversation_id: String,
    latest_event_id: i64,
) {
    let (mut sender, mut receiver) = socket.split();

    // Register before reading the backlog so nothing appended in between is lost.
    let mut connection = state.hub.connect(&conversation_id);
    let client_id = connection.client_id.clone();
    let mut cursor = ReplayCursor::new(latest_event_id);

    let greeting = protocol::connection_established(&client_id, &conversation_id);
    if send_text(&mut sender, &state, greeting).await.is_err() {
        return;
    }

    if latest_event_id >= 0 {
        match state.events.read_since(&conversation_id, latest_event_id).await {
            Ok(backlog) => {
                tracing::debug!("Replaying {} events to {}", backlog.len(), client_id);
                for event in backlog {
                    if deliver(&mut sender, &state, &mut cursor, event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Catch-up for {} failed: {}", client_id, e);
                let _ = send_text(&mut sender, &state, protocol::error_frame(&e.to_string())).await;
            }
        }
    }

    let idle = state.config.ws_idle_timeout;
    let mut deadline = Instant::now() + idle;

    loop {
        let mut lagged = false;
        tokio::select! {
            msg = receiver.next() => {
                deadline = Instant::now() + idle;
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_frame(&mut sender, &state, &conversation_id, &text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Client {} disconnected from {}", client_id, conversation_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error from {}: {}", client_id, e);
                        break;
                    }
                }
            }

            Some(event) = connection.events.recv() => {
                if deliver(&mut sender, &state, &mut cursor, event).await.is_err() {
                    tracing::info!("Failed to push event, client {} disconnected", client_id);
                    break;
                }
            }

            _ = connection.lagged.notified() => {
                lagged = true;
            }

            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!("Client {} idle for {:?}, closing", client_id, idle);
                let _ = sender.close().await;
                break;
            }
        }

        if lagged {
            tracing::debug!("Client {} fell behind on {}; re-reading", client_id, conversation_id);
            if resync(&mut sender, &state, &mut cursor, &mut connection).await.is_err() {
                break;
            }
        }
    }
    // `connection` drops here and leaves the hub.
}

/// Handles one inbound text frame. Only send failures are returned; bad frames are logged and dropped.
async fn handle_frame(
    sender: &mut WsSink,
    state: &KernelState,
    conversation_id: &str,
    text: &str,
) -> KernelResult<()> {
    let frame = match protocol::parse_frame(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!("Dropping frame on {}: {}", conversation_id, e);
            return Ok(());
        }
    };

    match frame {
        InboundFrame::Ping => send_text(sender, state, protocol::PONG.to_string()).await,
        InboundFrame::Pong | InboundFrame::Connect => Ok(()),
        InboundFrame::Event { name, payload } if name == protocol::USER_ACTION_EVENT => {
            let action = match UserAction::parse(payload) {
                Ok(action) => action,
                Err(e) => {
                    tracing::warn!("Dropping user action on {}: {}", conversation_id, e);
                    return Ok(());
                }
            };
            if let Err(message) = apply_user_action(state, conversation_id, action).await {
                send_text(sender, state, protocol::error_frame(&message)).await?;
            }
            Ok(())
        }
        InboundFrame::Event { name, .. } => {
            tracing::debug!("Ignoring event '{}' on {}", name, conversation_id);
            Ok(())
        }
    }
}

/// Records the action and routes it to the conversation's session. Returns a client-facing error message.
async fn apply_user_action(state: &KernelState, conversation_id: &str, action: UserAction) -> Result<(), String> {
    match action {
        UserAction::Message { content, payload } => {
            let draft = EventDraft::new(EventSource::User, EventKind::Message, payload.clone());
            state.events.append(conversation_id, draft).await.map_err(|e| e.to_string())?;
            // A conversation without a live session still keeps the message.
            if let Err(e) = state
                .dispatcher
                .forward_action(conversation_id, UserAction::Message { content, payload })
            {
                tracing::debug!("Message on {} not forwarded: {}", conversation_id, e);
            }
            Ok(())
        }
        UserAction::AgentStateChange { agent_state, payload } => {
            let draft = EventDraft::new(EventSource::User, EventKind::AgentStateUpdate, payload);
            state.events.append(conversation_id, draft).await.map_err(|e| e.to_string())?;
            if agent_state == "stopped" {
                let task_id = state.dispatcher.stop_scope(conversation_id).map_err(|e| e.to_string())?;
                tracing::info!("Stop of task {} requested from stream {}", task_id, conversation_id);
            }
            Ok(())
        }
        UserAction::Forward { action, payload } => {
            let name = action.clone();
            state
                .dispatcher
                .forward_action(conversation_id, UserAction::Forward { action, payload })
                .map_err(|e| format!("Cannot forward '{}': {}", name, e))
        }
    }
}
