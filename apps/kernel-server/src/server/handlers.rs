// [[CONDUIT]]/apps/kernel-server/src/server/handlers.rs
// Purpose: REST handlers for the task API. Every error leaves as {status: "error", ...}.
// Architecture: API Layer
// Dependencies: Axum, Dispatcher

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use serde_json::json;
use std::sync::Arc;

use crate::models::*;
use crate::observability::MetricsSnapshot;
use crate::registry::SessionSummary;
use crate::security::ApiKey;
use crate::server::KernelState;

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    since: Option<i64>,
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub live_sessions: usize,
    pub metrics: MetricsSnapshot,
}

pub async fn health(State(state): State<Arc<KernelState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Conduit Kernel is running".to_string(),
        live_sessions: state.sessions.len(),
        metrics: state.metrics.snapshot(),
    })
}

pub async fn execute_task(
    _auth: ApiKey,
    State(state): State<Arc<KernelState>>,
    Json(req): Json<ExecuteTaskRequest>,
) -> Json<TaskAck> {
    // Returns as soon as the task is queued; completion is observed via status or the stream.
    let ack = state.dispatcher.execute_task(req).await;
    tracing::info!("execute_task -> {} ({})", ack.task_id, ack.status);
    Json(ack)
}

pub async fn get_task_status(
    _auth: ApiKey,
    State(state): State<Arc<KernelState>>,
    Json(req): Json<TaskIdRequest>,
) -> Json<TaskStatusResponse> {
    Json(state.dispatcher.get_task_status(&req.task_id).await)
}

pub async fn cancel_task(
    _auth: ApiKey,
    State(state): State<Arc<KernelState>>,
    Json(req): Json<TaskIdRequest>,
) -> Json<TaskAck> {
    let ack = state.dispatcher.cancel_task(&req.task_id).await;
    tracing::info!("cancel_task {} -> {}", req.task_id, ack.status);
    Json(ack)
}

pub async fn list_sessions(
    _auth: ApiKey,
    State(state): State<Arc<KernelState>>,
) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list())
}

/// REST catch-up. Without `since` the whole conversation is returned.
pub async fn conversation_events(
    _auth: ApiKey,
    State(state): State<Arc<KernelState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let events = match query.since {
        Some(since) => state.events.read_since(&conversation_id, since).await,
        None => state.events.history(&conversation_id).await,
    };

    match events {
        Ok(events) => Ok(Json(json!({
            "conversation_id": conversation_id,
            "events": events,
        }))),
        Err(e) => {
            tracing::error!("Event read for {} failed: {}", conversation_id, e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "error", "message": e.to_string() })),
            ))
        }
    }
}
