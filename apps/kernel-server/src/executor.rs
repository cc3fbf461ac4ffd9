// [[CONDUIT]]/apps/kernel-server/src/executor.rs
// Purpose: Agent executors. The opaque collaborator a session hands its task to.
// Architecture: Runtime Layer
// Dependencies: reqwest, tokio-util, async-trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::KernelError;
use crate::event_log::EventLog;
use crate::events::{Event, EventDraft, EventKind, EventSource};
use crate::models::TaskSpec;
use crate::protocol::UserAction;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("agent service request failed: {0}")]
    Remote(#[from] reqwest::Error),
    #[error("agent reported failure: {0}")]
    Agent(String),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// How a session ended, as reported by its executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed { exit_status: String, submission: String },
    Cancelled,
}

/// Everything a running session can see and touch.
pub struct SessionContext {
    pub task_id: String,
    pub session_id: String,
    pub scope: String,
    pub spec: TaskSpec,
    pub cancel: CancellationToken,
    pub inbox: mpsc::Receiver<UserAction>,
    events: Arc<EventLog>,
}

impl SessionContext {
    pub fn new(
        task_id: &str,
        session_id: &str,
        scope: &str,
        spec: TaskSpec,
        cancel: CancellationToken,
        inbox: mpsc::Receiver<UserAction>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            scope: scope.to_string(),
            spec,
            cancel,
            inbox,
            events,
        }
    }

    pub async fn emit(&self, kind: EventKind, payload: Value) -> Result<Event, KernelError> {
        self.events
            .append(&self.scope, EventDraft::new(EventSource::Agent, kind, payload))
            .await
    }

    /// Waits `delay`, or returns true early if a stop was requested.
    pub async fn checkpoint(&self, delay: Duration) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Non-blocking drain of whatever users sent since the last call.
    pub fn take_actions(&mut self) -> Vec<UserAction> {
        let mut actions = Vec::new();
        while let Ok(action) = self.inbox.try_recv() {
            actions.push(action);
        }
        actions
    }
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the task to an outcome. Must observe `ctx.cancel` at its own safe points.
    async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome, ExecutionError>;
}

// === MOCK EXECUTOR ===

/// Scripted stand-in for a real agent: narrates each tool, then submits.
/// `echo <text>` submits `<text>`; anything else submits the prompt back.
pub struct MockExecutor {
    step_delay: Duration,
}

impl MockExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    fn submission_for(prompt: &str) -> String {
        match prompt.trim().strip_prefix("echo ") {
            Some(rest) => rest.trim().to_string(),
            None => prompt.to_string(),
        }
    }
}

#[async_trait]
impl AgentExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome, ExecutionError> {
        ctx.emit(
            EventKind::Message,
            json!({ "content": format!("Working on: {}", ctx.spec.prompt) }),
        )
        .await?;

        let tools = ctx.spec.tools.clone();
        for tool in tools {
            if ctx.checkpoint(self.step_delay).await {
                return Ok(Outcome::Cancelled);
            }
            ctx.emit(
                EventKind::Observation,
                json!({ "observation": "tool_call", "tool": tool, "extras": { "mock": true } }),
            )
            .await?;
        }

        if ctx.checkpoint(self.step_delay).await {
            return Ok(Outcome::Cancelled);
        }

        for action in ctx.take_actions() {
            ctx.emit(
                EventKind::Observation,
                json!({ "observation": "user_action", "received": action.payload() }),
            )
            .await?;
        }

        let submission = Self::submission_for(&ctx.spec.prompt);
        ctx.emit(EventKind::Message, json!({ "content": submission })).await?;

        Ok(Outcome::Completed {
            exit_status: "submitted".to_string(),
            submission,
        })
    }
}

// === REMOTE EXECUTOR ===

/// Body POSTed to the agent service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub task_id: String,
    pub session_id: String,
    pub conversation_id: String,
    pub prompt: String,
    pub context: HashMap<String, String>,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEvent {
    #[serde(default = "default_remote_kind")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Value,
}

fn default_remote_kind() -> EventKind {
    EventKind::Observation
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAgentResponse {
    pub success: bool,
    pub submission: Option<String>,
    pub exit_status: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub events: Vec<RemoteEvent>,
}

pub struct RemoteExecutor {
    http_client: reqwest::Client,
    base_url: String,
}

impl RemoteExecutor {
    pub fn new(http_client: reqwest::Client, base_url: &str) -> Self {
        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn invoke(&self, payload: &InvocationPayload) -> Result<RemoteAgentResponse, reqwest::Error> {
        let url = format!("{}/invoke", self.base_url);
        tracing::debug!("Sending invocation for task {} to {}", payload.task_id, url);

        self.http_client
            .post(&url)
            .json(payload)
            .send()
            .await?
            .error_for_status()?
            .json::<RemoteAgentResponse>()
            .await
    }
}

#[async_trait]
impl AgentExecutor for RemoteExecutor {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome, ExecutionError> {
        let payload = InvocationPayload {
            task_id: ctx.task_id.clone(),
            session_id: ctx.session_id.clone(),
            conversation_id: ctx.scope.clone(),
            prompt: ctx.spec.prompt.clone(),
            context: ctx.spec.context.clone(),
            tools: ctx.spec.tools.clone(),
        };

        // Dropping the request future aborts the HTTP call.
        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(Outcome::Cancelled),
            res = self.invoke(&payload) => res?,
        };

        let pending = ctx.take_actions();
        if !pending.is_empty() {
            tracing::warn!(
                "Remote agent finished task {} with {} undelivered user actions",
                ctx.task_id,
                pending.len()
            );
        }

        for event in response.events {
            ctx.emit(event.kind, event.payload).await?;
        }

        if !response.success {
            return Err(ExecutionError::Agent(
                response.error.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let submission = response.submission.unwrap_or_default();
        ctx.emit(EventKind::Message, json!({ "content": submission })).await?;

        Ok(Outcome::Completed {
            exit_status: response.exit_status.unwrap_or_else(|| "submitted".to_string()),
            submission,
        })
    }
}
