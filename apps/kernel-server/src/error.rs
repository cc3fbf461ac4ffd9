// [[CONDUIT]]/apps/kernel-server/src/error.rs
// Purpose: Error taxonomy shared by the event log, task store, registry and transport.
// Architecture: Domain Layer
// Dependencies: thiserror

use thiserror::Error;

use crate::models::TaskStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already registered: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("task {task_id} is already {status}")]
    AlreadyTerminal { task_id: String, status: TaskStatus },

    #[error("storage unavailable: {0}")]
    Storage(String),

    #[error("malformed frame: {0}")]
    Transport(String),

    #[error("dispatch queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("dispatcher is shutting down")]
    Unavailable,
}

impl KernelError {
    pub fn task_not_found(id: &str) -> Self {
        KernelError::NotFound { kind: "task", id: id.to_string() }
    }

    pub fn session_not_found(id: &str) -> Self {
        KernelError::NotFound { kind: "session", id: id.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KernelError::NotFound { .. })
    }

    /// Caller bugs (id collisions, double completion) rather than runtime conditions.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, KernelError::Duplicate { .. } | KernelError::AlreadyTerminal { .. })
    }
}

impl From<redis::RedisError> for KernelError {
    fn from(e: redis::RedisError) -> Self {
        KernelError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Storage(format!("serialization: {}", e))
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
