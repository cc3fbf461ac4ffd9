// [[CONDUIT]]/apps/kernel-server/src/runtime.rs
// Purpose: Task Dispatcher and session runner. Queue, workers, lifecycle bookkeeping.
// Architecture: Domain Logic Layer
// Dependencies: tokio, uuid, tokio-util

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{KernelError, KernelResult};
use crate::event_log::EventLog;
use crate::events::{EventDraft, EventKind, EventSource};
use crate::executor::{AgentExecutor, Outcome, SessionContext};
use crate::models::*;
use crate::observability::KernelMetrics;
use crate::protocol::UserAction;
use crate::registry::{SessionHandle, SessionRegistry};
use crate::task_store::TaskStore;

const STORAGE_RETRIES: usize = 3;
const STORAGE_BACKOFF: Duration = Duration::from_millis(200);
const RESTART_MESSAGE: &str = "Kernel restarted unexpectedly. Task terminated.";

/// A task waiting for a worker.
pub struct DispatchJob {
    pub task_id: String,
    pub session_id: String,
    pub scope: String,
    pub spec: TaskSpec,
    pub inbox: mpsc::Receiver<UserAction>,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// Runs dequeued jobs. Holds no queue sender, so workers exit once the dispatcher is dropped.
pub struct SessionRunner {
    tasks: Arc<dyn TaskStore>,
    events: Arc<EventLog>,
    sessions: Arc<SessionRegistry>,
    executor: Arc<dyn AgentExecutor>,
    metrics: Arc<KernelMetrics>,
}

pub struct Dispatcher {
    runner: Arc<SessionRunner>,
    queue: mpsc::Sender<DispatchJob>,
    queue_capacity: usize,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Builds the dispatcher and spawns its workers on the current runtime.
    pub fn start(
        tasks: Arc<dyn TaskStore>,
        events: Arc<EventLog>,
        sessions: Arc<SessionRegistry>,
        executor: Arc<dyn AgentExecutor>,
        metrics: Arc<KernelMetrics>,
        settings: DispatchSettings,
    ) -> Self {
        let capacity = settings.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let runner = Arc::new(SessionRunner {
            tasks,
            events,
            sessions,
            executor,
            metrics,
        });

        for worker_id in 0..settings.workers.max(1) {
            let runner = runner.clone();
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.worker_loop(worker_id, rx, shutdown).await });
        }

        tracing::info!(
            "Dispatcher started: {} workers, queue capacity {}, executor '{}'",
            settings.workers.max(1),
            capacity,
            runner.executor.name()
        );

        Dispatcher {
            runner,
            queue: tx,
            queue_capacity: capacity,
            shutdown,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.runner.sessions
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.runner.events
    }

    /// Accepts a task and returns at once. Always yields a task id, even on failure.
    pub async fn execute_task(&self, req: ExecuteTaskRequest) -> TaskAck {
        let task_id = Uuid::new_v4().to_string();

        match self.dispatch(&task_id, req.into()).await {
            Ok(()) => {
                self.runner.metrics.task_dispatched();
                TaskAck {
                    task_id,
                    status: TaskStatus::Pending.as_str().to_string(),
                    message: "Task accepted".to_string(),
                }
            }
            Err(e) => {
                self.runner.metrics.task_rejected();
                if e.is_programmer_error() {
                    tracing::error!("Dispatch of task {} hit a bug: {}", task_id, e);
                } else {
                    tracing::warn!("Dispatch of task {} failed: {}", task_id, e);
                }
                TaskAck::error(&task_id, format!("Failed to start task: {}", e))
            }
        }
    }

    async fn dispatch(&self, task_id: &str, spec: TaskSpec) -> KernelResult<()> {
        let session_id = Uuid::new_v4().to_string();
        let record = TaskRecord::new(task_id, &session_id, spec.clone());
        let scope = record.scope.clone();

        self.runner.tasks.create(record).await?;

        let (handle, inbox) = SessionHandle::new(&session_id, task_id, &scope);
        if let Err(e) = self.runner.sessions.register(handle) {
            self.reject(task_id, &e).await;
            return Err(e);
        }

        let job = DispatchJob {
            task_id: task_id.to_string(),
            session_id: session_id.clone(),
            scope,
            spec,
            inbox,
        };

        if let Err(e) = self.queue.try_send(job) {
            let err = match e {
                mpsc::error::TrySendError::Full(_) => KernelError::QueueFull(self.queue_capacity),
                mpsc::error::TrySendError::Closed(_) => KernelError::Unavailable,
            };
            self.runner.sessions.unregister(&session_id);
            self.reject(task_id, &err).await;
            return Err(err);
        }

        tracing::info!("Task {} queued as session {}", task_id, session_id);
        Ok(())
    }

    /// Leaves a short-lived error record so the caller's id resolves to something.
    async fn reject(&self, task_id: &str, cause: &KernelError) {
        let transition = Transition::Rejected {
            error: format!("Failed to start task: {}", cause),
        };
        if let Err(e) = self.runner.tasks.transition(task_id, transition).await {
            tracing::warn!("Could not record rejection of task {}: {}", task_id, e);
        }
    }

    /// Never fails: unknown ids and storage trouble come back as `status = "error"`.
    pub async fn get_task_status(&self, task_id: &str) -> TaskStatusResponse {
        let record = match self.runner.tasks.get(task_id).await {
            Ok(record) => record,
            Err(e) => {
                let result = if e.is_not_found() {
                    format!("Task {} not found", task_id)
                } else {
                    format!("Task status unavailable: {}", e)
                };
                return TaskStatusResponse {
                    task_id: task_id.to_string(),
                    status: TaskStatus::Error.as_str().to_string(),
                    result: Some(result),
                    events: Vec::new(),
                };
            }
        };

        let events = match self.runner.events.history(&record.scope).await {
            Ok(events) => events
                .iter()
                .filter_map(|e| serde_json::to_string(e).ok())
                .collect(),
            Err(e) => {
                tracing::warn!("Event history for task {} unavailable: {}", task_id, e);
                Vec::new()
            }
        };

        TaskStatusResponse {
            task_id: record.task_id,
            status: record.status.as_str().to_string(),
            result: record.result,
            events,
        }
    }

    /// Requests a cooperative stop. The task turns `cancelled` once its session winds down.
    pub async fn cancel_task(&self, task_id: &str) -> TaskAck {
        let record = match self.runner.tasks.get(task_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return TaskAck::error(task_id, format!("Task {} not found", task_id)),
            Err(e) => return TaskAck::error(task_id, format!("Task status unavailable: {}", e)),
        };

        if record.status.is_terminal() {
            return TaskAck::error(task_id, format!("Task {} is already {}", task_id, record.status));
        }

        // The record keeps its current status until the session confirms the stop.
        match self.runner.sessions.stop(&record.session_id) {
            Ok(()) => TaskAck {
                task_id: task_id.to_string(),
                status: record.status.as_str().to_string(),
                message: format!("Stop requested for task {}; it turns cancelled once the session stops", task_id),
            },
            Err(_) => TaskAck::error(task_id, "Thread not found"),
        }
    }

    /// Hands a user action to the session bound to `scope`.
    pub fn forward_action(&self, scope: &str, action: UserAction) -> KernelResult<()> {
        let handle = self
            .runner
            .sessions
            .find_by_scope(scope)
            .ok_or_else(|| KernelError::NotFound { kind: "running session for conversation", id: scope.to_string() })?;
        handle.deliver(action)
    }

    /// Stops whatever session is running in `scope`.
    pub fn stop_scope(&self, scope: &str) -> KernelResult<String> {
        let handle = self
            .runner
            .sessions
            .find_by_scope(scope)
            .ok_or_else(|| KernelError::NotFound { kind: "running session for conversation", id: scope.to_string() })?;
        self.runner.sessions.stop(&handle.session_id)?;
        Ok(handle.task_id)
    }

    /// Fails tasks a previous process left pending or running.
    pub async fn recover_orphans(&self) -> KernelResult<usize> {
        let ids = self.runner.tasks.active_ids().await?;
        tracing::info!("Found {} active tasks in persistence layer.", ids.len());

        let mut recovered = 0;
        for task_id in ids {
            if self.runner.sessions.list().iter().any(|s| s.task_id == task_id) {
                continue;
            }
            match self.runner.tasks.mark_failed(&task_id, RESTART_MESSAGE).await {
                Ok(_) => {
                    tracing::warn!("Marked orphaned task {} as failed", task_id);
                    recovered += 1;
                }
                Err(e) => tracing::error!("Failed to recover task {}: {}", task_id, e),
            }
        }
        Ok(recovered)
    }

    /// Idle workers exit; running sessions are asked to stop at their next checkpoint.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for session in self.runner.sessions.list() {
            let _ = self.runner.sessions.stop(&session.session_id);
        }
        tracing::info!("Dispatcher shutting down");
    }
}

impl SessionRunner {
    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        rx: Arc<Mutex<mpsc::Receiver<DispatchJob>>>,
        shutdown: CancellationToken,
    ) {
        tracing::debug!("Worker {} ready", worker_id);
        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = async { rx.lock().await.recv().await } => job,
            };
            match job {
                Some(job) => self.run_session(job).await,
                None => break,
            }
        }
        tracing::debug!("Worker {} exiting", worker_id);
    }

    /// Drives one job from pending to a terminal state, then unregisters its session.
    async fn run_session(&self, job: DispatchJob) {
        let DispatchJob { task_id, session_id, scope, spec, inbox } = job;

        let handle = match self.sessions.get(&session_id) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Session {} for task {} vanished before start: {}", session_id, task_id, e);
                self.finish(&task_id, Transition::Failed { error: "Session lost before start".to_string() })
                    .await;
                return;
            }
        };

        if handle.stop_requested() {
            self.finish(&task_id, Transition::Cancelled { reason: "Cancelled before start".to_string() })
                .await;
            self.emit_state(&scope, "stopped", &task_id).await;
            self.metrics.task_cancelled();
            self.sessions.unregister(&session_id);
            return;
        }

        if let Err(e) = self.with_storage_retry(|| self.tasks.mark_running(&task_id)).await {
            tracing::error!("Task {} could not start: {}", task_id, e);
            handle.mark_finished();
            self.metrics.task_failed();
            let message = format!("Task could not start: {}", e);
            self.emit(&scope, EventKind::Error, serde_json::json!({ "error": message, "task_id": task_id }))
                .await;
            self.finish(&task_id, Transition::Failed { error: message }).await;
            self.emit_state(&scope, "error", &task_id).await;
            self.sessions.unregister(&session_id);
            return;
        }
        self.emit_state(&scope, "running", &task_id).await;
        tracing::info!("Session {} started task {}", session_id, task_id);

        let mut ctx = SessionContext::new(
            &task_id,
            &session_id,
            &scope,
            spec,
            handle.cancellation(),
            inbox,
            self.events.clone(),
        );
        let result = self.executor.run(&mut ctx).await;
        handle.mark_finished();

        let (transition, state) = match result {
            Ok(Outcome::Completed { exit_status, submission }) => {
                self.metrics.task_completed();
                (Transition::Completed { exit_status, submission }, "finished")
            }
            Ok(Outcome::Cancelled) => {
                self.metrics.task_cancelled();
                (Transition::Cancelled { reason: "Stopped by request".to_string() }, "stopped")
            }
            Err(e) => {
                self.metrics.task_failed();
                let message = e.to_string();
                self.emit(&scope, EventKind::Error, serde_json::json!({ "error": message, "task_id": task_id }))
                    .await;
                (Transition::Failed { error: message }, "error")
            }
        };

        self.finish(&task_id, transition).await;
        self.emit_state(&scope, state, &task_id).await;

        // Executor has returned, so the session has confirmed it stopped.
        self.sessions.unregister(&session_id);
        tracing::info!("Session {} for task {} ended ({})", session_id, task_id, state);
    }

    async fn finish(&self, task_id: &str, transition: Transition) {
        match self
            .with_storage_retry(|| self.tasks.transition(task_id, transition.clone()))
            .await
        {
            Ok(record) => tracing::debug!("Task {} is now {}", task_id, record.status),
            Err(e @ KernelError::AlreadyTerminal { .. }) => {
                tracing::error!("Double completion of task {}: {}", task_id, e)
            }
            Err(e) => tracing::error!("Failed to persist outcome of task {}: {}", task_id, e),
        }
    }

    async fn with_storage_retry<F, Fut>(&self, mut op: F) -> KernelResult<TaskRecord>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = KernelResult<TaskRecord>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(KernelError::Storage(msg)) if attempt + 1 < STORAGE_RETRIES => {
                    attempt += 1;
                    tracing::warn!("Storage error (attempt {}/{}): {}", attempt, STORAGE_RETRIES, msg);
                    tokio::time::sleep(STORAGE_BACKOFF * attempt as u32).await;
                }
                other => return other,
            }
        }
    }

    async fn emit(&self, scope: &str, kind: EventKind, payload: serde_json::Value) {
        let draft = EventDraft::new(EventSource::System, kind, payload);
        if let Err(e) = self.events.append(scope, draft).await {
            tracing::warn!("Dropped {:?} event for scope {}: {}", kind, scope, e);
        }
    }

    async fn emit_state(&self, scope: &str, state: &str, task_id: &str) {
        if let Err(e) = self.events.append(scope, EventDraft::agent_state(state, task_id)).await {
            tracing::warn!("Dropped state update '{}' for scope {}: {}", state, scope, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::MemoryEventStore;
    use crate::executor::{ExecutionError, MockExecutor};
    use crate::task_store::MemoryTaskStore;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Harness {
        dispatcher: Dispatcher,
        tasks: Arc<MemoryTaskStore>,
    }

    fn dispatcher_over(
        tasks: Arc<dyn TaskStore>,
        executor: Arc<dyn AgentExecutor>,
        metrics: Arc<KernelMetrics>,
        settings: DispatchSettings,
    ) -> Dispatcher {
        let events = Arc::new(EventLog::new(Arc::new(MemoryEventStore::new()), 256, metrics.clone()));
        Dispatcher::start(tasks, events, Arc::new(SessionRegistry::new()), executor, metrics, settings)
    }

    fn harness_with(executor: Arc<dyn AgentExecutor>, settings: DispatchSettings) -> Harness {
        let tasks = Arc::new(MemoryTaskStore::new(Retention::default()));
        let dispatcher = dispatcher_over(tasks.clone(), executor, Arc::new(KernelMetrics::default()), settings);
        Harness { dispatcher, tasks }
    }

    fn harness(step_delay: Duration) -> Harness {
        harness_with(Arc::new(MockExecutor::new(step_delay)), DispatchSettings::default())
    }

    fn request(prompt: &str) -> ExecuteTaskRequest {
        ExecuteTaskRequest {
            prompt: prompt.to_string(),
            context: HashMap::new(),
            tools: vec![],
        }
    }

    async fn wait_for_terminal(dispatcher: &Dispatcher, task_id: &str) -> TaskStatusResponse {
        for _ in 0..200 {
            let status = dispatcher.get_task_status(task_id).await;
            if matches!(status.status.as_str(), "completed" | "error" | "cancelled") {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", task_id);
    }

    #[tokio::test]
    async fn echo_task_runs_to_completion() {
        let h = harness(Duration::from_millis(50));
        let ack = h.dispatcher.execute_task(request("echo hi")).await;
        assert_eq!(ack.status, "pending");
        assert!(!ack.task_id.is_empty());

        let early = h.dispatcher.get_task_status(&ack.task_id).await;
        assert!(matches!(early.status.as_str(), "pending" | "running"), "got {}", early.status);

        let done = wait_for_terminal(&h.dispatcher, &ack.task_id).await;
        assert_eq!(done.status, "completed");
        assert_eq!(done.result.as_deref(), Some("hi"));
        assert!(!done.events.is_empty());

        // Session is unregistered once the terminal state is recorded.
        for _ in 0..50 {
            if h.dispatcher.sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.dispatcher.sessions().is_empty());
    }

    #[tokio::test]
    async fn status_is_stable_without_state_change() {
        let h = harness(Duration::ZERO);
        let ack = h.dispatcher.execute_task(request("echo same")).await;
        wait_for_terminal(&h.dispatcher, &ack.task_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let first = h.dispatcher.get_task_status(&ack.task_id).await;
        let second = h.dispatcher.get_task_status(&ack.task_id).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_task_reports_error() {
        let h = harness(Duration::ZERO);
        let status = h.dispatcher.get_task_status("missing").await;
        assert_eq!(status.status, "error");
        assert!(status.result.expect("result").contains("not found"));
        assert!(status.events.is_empty());

        let ack = h.dispatcher.cancel_task("missing").await;
        assert_eq!(ack.status, "error");
        assert_eq!(ack.task_id, "missing");
    }

    #[tokio::test]
    async fn cancel_stops_a_running_session() {
        let h = harness(Duration::from_secs(30));
        let mut req = request("slow");
        req.tools = vec!["bash".to_string()];
        let ack = h.dispatcher.execute_task(req).await;

        let cancel = h.dispatcher.cancel_task(&ack.task_id).await;
        assert!(matches!(cancel.status.as_str(), "pending" | "running"), "got {}", cancel.status);
        assert!(cancel.message.contains("Stop requested"));

        let done = wait_for_terminal(&h.dispatcher, &ack.task_id).await;
        assert_eq!(done.status, "cancelled");

        let again = h.dispatcher.cancel_task(&ack.task_id).await;
        assert_eq!(again.status, "error");
        assert!(again.message.contains("already cancelled"));
    }

    struct Stuck;

    #[async_trait]
    impl AgentExecutor for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome, ExecutionError> {
            ctx.cancel.cancelled().await;
            Ok(Outcome::Cancelled)
        }
    }

    #[tokio::test]
    async fn full_queue_still_returns_a_task_id() {
        let h = harness_with(Arc::new(Stuck), DispatchSettings { workers: 1, queue_capacity: 1 });

        // One job occupies the worker, one fills the queue.
        let first = h.dispatcher.execute_task(request("a")).await;
        for _ in 0..50 {
            if h.dispatcher.get_task_status(&first.task_id).await.status == "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let second = h.dispatcher.execute_task(request("b")).await;
        assert_eq!(second.status, "pending");

        let third = h.dispatcher.execute_task(request("c")).await;
        assert_eq!(third.status, "error");
        assert!(!third.task_id.is_empty());
        assert!(third.message.contains("queue is full"));

        let status = h.dispatcher.get_task_status(&third.task_id).await;
        assert_eq!(status.status, "error");

        h.dispatcher.cancel_task(&first.task_id).await;
        h.dispatcher.cancel_task(&second.task_id).await;
        assert_eq!(wait_for_terminal(&h.dispatcher, &second.task_id).await.status, "cancelled");
    }

    struct Failing;

    #[async_trait]
    impl AgentExecutor for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn run(&self, _ctx: &mut SessionContext) -> Result<Outcome, ExecutionError> {
            Err(ExecutionError::Agent("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn executor_failure_marks_task_error() {
        let h = harness_with(Arc::new(Failing), DispatchSettings::default());
        let ack = h.dispatcher.execute_task(request("anything")).await;
        let done = wait_for_terminal(&h.dispatcher, &ack.task_id).await;
        assert_eq!(done.status, "error");
        assert!(done.result.expect("result").contains("model unavailable"));
        assert!(done.events.iter().any(|e| e.contains("\"type\":\"error\"")));
    }

    #[tokio::test]
    async fn orphaned_tasks_are_failed_on_recovery() {
        let h = harness(Duration::ZERO);
        let orphan = TaskRecord::new("orphan", "old-session", TaskSpec {
            prompt: String::new(),
            context: HashMap::new(),
            tools: vec![],
        });
        h.tasks.create(orphan).await.expect("create");

        assert_eq!(h.dispatcher.recover_orphans().await.expect("recover"), 1);
        let status = h.dispatcher.get_task_status("orphan").await;
        assert_eq!(status.status, "error");
        assert_eq!(status.result.as_deref(), Some(RESTART_MESSAGE));
    }

    #[tokio::test]
    async fn conversation_context_sets_scope() {
        let h = harness(Duration::from_millis(200));
        let mut req = request("echo scoped");
        req.context.insert("conversation_id".to_string(), "conv-1".to_string());
        let ack = h.dispatcher.execute_task(req).await;

        let record = h.tasks.get(&ack.task_id).await.expect("record");
        assert_eq!(record.scope, "conv-1");

        let task_id = h.dispatcher.stop_scope("conv-1").expect("stop by scope");
        assert_eq!(task_id, ack.task_id);
        assert_eq!(wait_for_terminal(&h.dispatcher, &ack.task_id).await.status, "cancelled");
        assert!(h.dispatcher.stop_scope("conv-1").is_err());
    }

    /// Memory store whose `running` write always fails, as if the backend went away mid-dispatch.
    struct UnreachableOnStart {
        inner: MemoryTaskStore,
    }

    #[async_trait]
    impl TaskStore for UnreachableOnStart {
        async fn create(&self, record: TaskRecord) -> KernelResult<()> {
            self.inner.create(record).await
        }

        async fn get(&self, task_id: &str) -> KernelResult<TaskRecord> {
            self.inner.get(task_id).await
        }

        async fn transition(&self, task_id: &str, transition: Transition) -> KernelResult<TaskRecord> {
            if transition == Transition::Running {
                return Err(KernelError::Storage("connection refused".to_string()));
            }
            self.inner.transition(task_id, transition).await
        }

        async fn active_ids(&self) -> KernelResult<Vec<String>> {
            self.inner.active_ids().await
        }

        async fn purge_expired(&self) -> KernelResult<usize> {
            self.inner.purge_expired().await
        }
    }

    #[tokio::test]
    async fn storage_failure_at_start_fails_the_task() {
        let metrics = Arc::new(KernelMetrics::default());
        let store = Arc::new(UnreachableOnStart { inner: MemoryTaskStore::new(Retention::default()) });
        let dispatcher = dispatcher_over(
            store,
            Arc::new(MockExecutor::new(Duration::ZERO)),
            metrics.clone(),
            DispatchSettings::default(),
        );

        let ack = dispatcher.execute_task(request("echo never")).await;
        assert_eq!(ack.status, "pending");

        let done = wait_for_terminal(&dispatcher, &ack.task_id).await;
        assert_eq!(done.status, "error");
        assert!(done.result.expect("result").contains("connection refused"));

        // The session leaves the registry only after its last state event is logged.
        for _ in 0..50 {
            if dispatcher.sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dispatcher.sessions().is_empty());

        let settled = dispatcher.get_task_status(&ack.task_id).await;
        assert!(settled.events.iter().any(|e| e.contains("\"type\":\"error\"")));
        assert!(settled.events.iter().any(|e| e.contains("\"agent_state\":\"error\"")));
        assert_eq!(metrics.snapshot().tasks_failed, 1);

        let cancel = dispatcher.cancel_task(&ack.task_id).await;
        assert_eq!(cancel.status, "error");
        assert!(cancel.message.contains("already error"));
    }

    /// Finishes its own task out of band before reporting success.
    struct Preempted {
        tasks: Arc<MemoryTaskStore>,
    }

    #[async_trait]
    impl AgentExecutor for Preempted {
        fn name(&self) -> &'static str {
            "preempted"
        }

        async fn run(&self, ctx: &mut SessionContext) -> Result<Outcome, ExecutionError> {
            self.tasks.mark_failed(&ctx.task_id, "operator abort").await?;
            Ok(Outcome::Completed { exit_status: "submitted".into(), submission: "late".into() })
        }
    }

    #[tokio::test]
    async fn late_completion_keeps_the_first_terminal_state() {
        let tasks = Arc::new(MemoryTaskStore::new(Retention::default()));
        let dispatcher = dispatcher_over(
            tasks.clone(),
            Arc::new(Preempted { tasks: tasks.clone() }),
            Arc::new(KernelMetrics::default()),
            DispatchSettings::default(),
        );

        let ack = dispatcher.execute_task(request("race")).await;
        let done = wait_for_terminal(&dispatcher, &ack.task_id).await;
        assert_eq!(done.status, "error");
        assert_eq!(done.result.as_deref(), Some("operator abort"));

        // The rejected write does not stop the runner from winding the session down.
        for _ in 0..50 {
            if dispatcher.sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(dispatcher.sessions().is_empty());
        let record = tasks.get(&ack.task_id).await.expect("record");
        assert_eq!(record.exit_status.as_deref(), Some("error"));
    }
}
