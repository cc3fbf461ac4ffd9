// [[CONDUIT]]/apps/kernel-server/src/server/mod.rs
// Purpose: Shared server state, backend wiring and the HTTP/WebSocket router.
// Architecture: API Layer
// Dependencies: Axum, Tower, tower-http, Redis

pub mod handlers;
pub mod socket;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use anyhow::Context;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Backend, KernelConfig};
use crate::event_log::{EventLog, EventStore, MemoryEventStore, RedisEventStore};
use crate::executor::{AgentExecutor, MockExecutor, RemoteExecutor};
use crate::hub::ConnectionHub;
use crate::observability::KernelMetrics;
use crate::registry::SessionRegistry;
use crate::runtime::Dispatcher;
use crate::task_store::{MemoryTaskStore, RedisTaskStore, TaskStore};

/// Everything the handlers share. Built once at boot, torn down at shutdown.
pub struct KernelState {
    pub config: KernelConfig,
    pub dispatcher: Dispatcher,
    pub events: Arc<EventLog>,
    pub sessions: Arc<SessionRegistry>,
    pub hub: Arc<ConnectionHub>,
    pub tasks: Arc<dyn TaskStore>,
    pub metrics: Arc<KernelMetrics>,
}

impl KernelState {
    /// Wires stores, executor, dispatcher and hub for the configured backend.
    pub async fn build(config: KernelConfig) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(KernelMetrics::default());

        let (event_store, tasks, executor): (Arc<dyn EventStore>, Arc<dyn TaskStore>, Arc<dyn AgentExecutor>) =
            match config.backend {
                Backend::Mock => {
                    tracing::warn!("Running with the mock backend. Nothing is persisted.");
                    (
                        Arc::new(MemoryEventStore::new()),
                        Arc::new(MemoryTaskStore::new(config.retention)),
                        Arc::new(MockExecutor::new(config.mock_step_delay)),
                    )
                }
                Backend::Live => {
                    let url = config
                        .redis_url
                        .as_deref()
                        .context("REDIS_URL is required for the live backend")?;
                    let client = redis::Client::open(url).context("invalid REDIS_URL")?;
                    let conn = redis::aio::ConnectionManager::new(client)
                        .await
                        .context("failed to connect to Redis")?;
                    tracing::info!("Redis persistence initialized: {}", url);

                    let http_client = reqwest::Client::builder()
                        .build()
                        .context("failed to build HTTP client")?;
                    (
                        Arc::new(RedisEventStore::new(conn.clone())),
                        Arc::new(RedisTaskStore::new(conn, config.retention)),
                        Arc::new(RemoteExecutor::new(http_client, &config.agent_url)),
                    )
                }
            };

        let events = Arc::new(EventLog::new(event_store, config.event_bus_capacity, metrics.clone()));
        let sessions = Arc::new(SessionRegistry::new());
        let hub = Arc::new(ConnectionHub::new(config.connection_buffer, metrics.clone()));
        hub.spawn_fanout(events.subscribe());

        let dispatcher = Dispatcher::start(
            tasks.clone(),
            events.clone(),
            sessions.clone(),
            executor,
            metrics.clone(),
            config.dispatch,
        );

        Ok(Arc::new(KernelState {
            config,
            dispatcher,
            events,
            sessions,
            hub,
            tasks,
            metrics,
        }))
    }

    /// Periodically drops expired task records.
    pub fn spawn_retention_sweeper(self: &Arc<Self>, every: std::time::Duration) {
        let state = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(state) = state.upgrade() else { break };
                match state.tasks.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Purged {} expired task records", n),
                    Err(e) => tracing::warn!("Retention sweep failed: {}", e),
                }
            }
        });
    }
}

pub fn router(state: Arc<KernelState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    // The stream route stays outside the request timeout; its lifetime is the connection's.
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/execute_task", post(handlers::execute_task))
        .route("/get_task_status", post(handlers::get_task_status))
        .route("/cancel_task", post(handlers::cancel_task))
        .route("/sessions", get(handlers::list_sessions))
        .route("/conversations/:conversation_id/events", get(handlers::conversation_events))
        .layer(TimeoutLayer::new(state.config.http_timeout));

    let stream = Router::new()
        .route("/socket.io/", get(socket::ws_conversation_stream))
        .route("/ws", get(socket::ws_conversation_stream));

    api.merge(stream)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}
