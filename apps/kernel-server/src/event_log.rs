// [[CONDUIT]]/apps/kernel-server/src/event_log.rs
// Purpose: Append-only, per-conversation event log with catch-up reads and a live bus.
// Architecture: Persistence Layer
// Dependencies: DashMap, Redis, Tokio

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::error::{KernelError, KernelResult};
use crate::events::{now_millis, Event, EventBody, EventDraft};
use crate::observability::KernelMetrics;

/// Backing store for events. Implementations assign ids: first id of a scope is 0,
/// each append takes the next integer.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, scope: &str, draft: EventDraft, timestamp: i64) -> KernelResult<Event>;

    /// Events with `id > after`, ascending.
    async fn load_after(&self, scope: &str, after: i64) -> KernelResult<Vec<Event>>;
}

// === IN-MEMORY STORE ===

#[derive(Default)]
pub struct MemoryEventStore {
    scopes: DashMap<String, Vec<Event>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append(&self, scope: &str, draft: EventDraft, timestamp: i64) -> KernelResult<Event> {
        // The entry guard holds the shard lock, so id allocation and push are one step.
        let mut events = self.scopes.entry(scope.to_string()).or_default();
        let event = Event::from_draft(events.len() as i64, scope, draft, timestamp);
        events.push(event.clone());
        Ok(event)
    }

    async fn load_after(&self, scope: &str, after: i64) -> KernelResult<Vec<Event>> {
        // No id can follow i64::MAX.
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(start.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .scopes
            .get(scope)
            .map(|events| events.iter().skip(start).cloned().collect())
            .unwrap_or_default())
    }
}

// === REDIS STORE ===

// Allocates the id and stores the event in one round trip. ARGV[1] is the event JSON
// without its id; the id is spliced in as the first field.
const APPEND_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[1]) - 1
local member = '{"id":' .. id .. ',' .. string.sub(ARGV[1], 2)
redis.call('ZADD', KEYS[2], id, member)
return id
"#;

pub struct RedisEventStore {
    conn: ConnectionManager,
    append_script: redis::Script,
}

impl RedisEventStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            append_script: redis::Script::new(APPEND_SCRIPT),
        }
    }

    fn seq_key(scope: &str) -> String {
        format!("conversation:{}:seq", scope)
    }

    fn events_key(scope: &str) -> String {
        format!("conversation:{}:events", scope)
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn append(&self, scope: &str, draft: EventDraft, timestamp: i64) -> KernelResult<Event> {
        let body = serde_json::to_string(&EventBody {
            scope,
            source: draft.source,
            kind: draft.kind,
            payload: &draft.payload,
            timestamp,
        })?;

        let mut con = self.conn.clone();
        let id: i64 = self
            .append_script
            .key(Self::seq_key(scope))
            .key(Self::events_key(scope))
            .arg(body)
            .invoke_async(&mut con)
            .await?;

        Ok(Event::from_draft(id, scope, draft, timestamp))
    }

    async fn load_after(&self, scope: &str, after: i64) -> KernelResult<Vec<Event>> {
        let mut con = self.conn.clone();
        let members: Vec<String> = con
            .zrangebyscore(Self::events_key(scope), format!("({}", after), "+inf")
            .await?;

        members
            .iter()
            .map(|m| serde_json::from_str::<Event>(m).map_err(KernelError::from))
            .collect()
    }
}

// === EVENT LOG ===

/// Orders appends per scope and publishes each stored event on the process-wide bus.
pub struct EventLog {
    store: Arc<dyn EventStore>,
    scope_locks: DashMap<String, Arc<Mutex<()>>>,
    bus: broadcast::Sender<Event>,
    metrics: Arc<KernelMetrics>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>, bus_capacity: usize, metrics: Arc<KernelMetrics>) -> Self {
        let (bus, _) = broadcast::channel(bus_capacity.max(1));
        Self {
            store,
            scope_locks: DashMap::new(),
            bus,
            metrics,
        }
    }

    fn lock_for(&self, scope: &str) -> Arc<Mutex<()>> {
        self.scope_locks
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Stores `draft` under the next id of `scope` and publishes it.
    ///
    /// The scope lock is held across store and publish so bus order always equals id order.
    pub async fn append(&self, scope: &str, draft: EventDraft) -> KernelResult<Event> {
        let lock = self.lock_for(scope);
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(scope, draft).await
        };
        drop(lock);
        self.release_lock(scope);
        result
    }

    async fn append_locked(&self, scope: &str, draft: EventDraft) -> KernelResult<Event> {
        let event = self.store.append(scope, draft, now_millis()).await.map_err(|e| {
            tracing::error!("Failed to append event to scope {}: {}", scope, e);
            e
        })?;

        self.metrics.event_appended();
        // No receivers is fine; nobody is streaming this scope yet.
        let _ = self.bus.send(event.clone());
        tracing::debug!("Appended event {} to scope {}", event.id, scope);
        Ok(event)
    }

    /// Drops the scope's lock once no appender holds or waits on it.
    /// `lock_for` clones under the same shard lock, so a waiter always keeps the count above one.
    fn release_lock(&self, scope: &str) {
        self.scope_locks.remove_if(scope, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Scopes with an append in flight.
    pub fn tracked_scopes(&self) -> usize {
        self.scope_locks.len()
    }

    /// Events after `last_seen_id`. A negative id means the caller wants no backlog.
    pub async fn read_since(&self, scope: &str, last_seen_id: i64) -> KernelResult<Vec<Event>> {
        if last_seen_id < 0 {
            return Ok(Vec::new());
        }
        self.store.load_after(scope, last_seen_id).await
    }

    /// Full history of `scope`.
    pub async fn history(&self, scope: &str) -> KernelResult<Vec<Event>> {
        self.store.load_after(scope, -1).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, EventSource};
    use serde_json::json;

    fn log() -> Arc<EventLog> {
        Arc::new(EventLog::new(
            Arc::new(MemoryEventStore::new()),
            1024,
            Arc::new(KernelMetrics::default()),
        ))
    }

    fn message(text: &str) -> EventDraft {
        EventDraft::new(EventSource::User, EventKind::Message, json!({ "content": text }))
    }

    #[tokio::test]
    async fn ids_start_at_zero_per_scope() {
        let log = log();
        let a0 = log.append("a", message("one")).await.expect("append");
        let a1 = log.append("a", message("two")).await.expect("append");
        let b0 = log.append("b", message("other")).await.expect("append");
        assert_eq!((a0.id, a1.id, b0.id), (0, 1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_gap_free() {
        let log = log();
        let mut handles = Vec::new();
        for writer in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    log.append("shared", message(&format!("{}-{}", writer, i)))
                        .await
                        .expect("append");
                }
            }));
        }
        for h in handles {
            h.await.expect("writer task");
        }

        let ids: Vec<i64> = log.history("shared").await.expect("history").iter().map(|e| e.id).collect();
        assert_eq!(ids, (0..200).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn read_since_excludes_boundary_and_negative_means_live_only() {
        let log = log();
        for i in 0..3 {
            log.append("conv", message(&i.to_string())).await.expect("append");
        }

        assert!(log.read_since("conv", -1).await.expect("read").is_empty());

        let ids: Vec<i64> = log.read_since("conv", 0).await.expect("read").iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(log.read_since("conv", 2).await.expect("read").is_empty());
        assert!(log.read_since("unknown", 0).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn read_since_at_the_largest_id_is_empty() {
        let log = log();
        log.append("conv", message("only")).await.expect("append");
        assert!(log.read_since("conv", i64::MAX).await.expect("read").is_empty());
        assert!(log.read_since("conv", i64::MAX - 1).await.expect("read").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn scope_locks_are_released_after_appends() {
        let log = log();
        let mut handles = Vec::new();
        for task in 0..16 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let scope = format!("task-{}", task % 4);
                for i in 0..10 {
                    log.append(&scope, message(&i.to_string())).await.expect("append");
                }
            }));
        }
        for h in handles {
            h.await.expect("writer task");
        }

        assert_eq!(log.tracked_scopes(), 0);
        for task in 0..4 {
            let ids: Vec<i64> = log
                .history(&format!("task-{}", task))
                .await
                .expect("history")
                .iter()
                .map(|e| e.id)
                .collect();
            assert_eq!(ids, (0..40).collect::<Vec<i64>>());
        }
    }

    #[tokio::test]
    async fn bus_delivers_in_id_order() {
        let log = log();
        let mut rx = log.subscribe();
        for i in 0..5 {
            log.append("conv", message(&i.to_string())).await.expect("append");
        }
        for expected in 0..5 {
            let event = rx.recv().await.expect("bus event");
            assert_eq!(event.id, expected);
        }
    }
}
