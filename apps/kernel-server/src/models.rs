// [[CONDUIT]]/apps/kernel-server/src/models.rs
// Purpose: Task records, status lifecycle and the wire DTOs of the task API.
// Architecture: Domain Model Layer
// Dependencies: Serde, Chrono

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller asked for. Immutable once dispatched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSpec {
    pub prompt: String,
    pub context: HashMap<String, String>,
    pub tools: Vec<String>,
}

impl TaskSpec {
    /// Conversation the task's events are ordered under; defaults to the task itself.
    pub fn scope_for(&self, task_id: &str) -> String {
        self.context
            .get("conversation_id")
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_else(|| task_id.to_string())
    }
}

/// Durable task/run record. Keyed by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub task_id: String,
    pub session_id: String,
    pub scope: String,
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub exit_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Forward-only status changes a store may apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Running,
    Completed { exit_status: String, submission: String },
    Failed { error: String },
    Cancelled { reason: String },
    /// Failed before any session could start.
    Rejected { error: String },
}

/// How long terminal records are kept around.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub terminal: std::time::Duration,
    pub phantom: std::time::Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            terminal: std::time::Duration::from_secs(86_400),
            phantom: std::time::Duration::from_secs(3_600),
        }
    }
}

impl TaskRecord {
    pub fn new(task_id: &str, session_id: &str, spec: TaskSpec) -> Self {
        TaskRecord {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            scope: spec.scope_for(task_id),
            spec,
            status: TaskStatus::Pending,
            result: None,
            exit_status: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Applies `transition` in place. Terminal records never change again.
    pub fn apply(
        &mut self,
        transition: &Transition,
        now: DateTime<Utc>,
        retention: &Retention,
    ) -> Result<(), KernelError> {
        if self.status.is_terminal() {
            return Err(KernelError::AlreadyTerminal {
                task_id: self.task_id.clone(),
                status: self.status,
            });
        }

        let ttl = match transition {
            Transition::Running => {
                if self.status == TaskStatus::Pending {
                    self.status = TaskStatus::Running;
                    self.started_at = Some(now);
                }
                return Ok(());
            }
            Transition::Completed { exit_status, submission } => {
                self.status = TaskStatus::Completed;
                self.exit_status = Some(exit_status.clone());
                self.result = Some(submission.clone());
                retention.terminal
            }
            Transition::Failed { error } => {
                self.status = TaskStatus::Error;
                self.exit_status = Some("error".to_string());
                self.result = Some(error.clone());
                retention.terminal
            }
            Transition::Cancelled { reason } => {
                self.status = TaskStatus::Cancelled;
                self.exit_status = Some("cancelled".to_string());
                self.result = Some(reason.clone());
                retention.terminal
            }
            Transition::Rejected { error } => {
                self.status = TaskStatus::Error;
                self.exit_status = Some("rejected".to_string());
                self.result = Some(error.clone());
                retention.phantom
            }
        };

        self.completed_at = Some(now);
        self.expires_at = Duration::from_std(ttl).ok().map(|d| now + d);
        Ok(())
    }

    /// Seconds until expiry, as used for store-side TTLs.
    pub fn ttl_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|t| (t - now).num_seconds().max(1))
    }
}

// === Task API DTOs ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTaskRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub context: HashMap<String, String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl From<ExecuteTaskRequest> for TaskSpec {
    fn from(req: ExecuteTaskRequest) -> Self {
        TaskSpec {
            prompt: req.prompt,
            context: req.context,
            tools: req.tools,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: String,
}

/// Response shape shared by `execute_task` and `cancel_task`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAck {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

impl TaskAck {
    pub fn error(task_id: &str, message: impl Into<String>) -> Self {
        TaskAck {
            task_id: task_id.to_string(),
            status: TaskStatus::Error.as_str().to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: String,
    pub result: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}
