// [[CONDUIT]]/apps/kernel-server/src/hub.rs
// Purpose: Connection hub. Tracks stream connections per conversation and fans events out to them.
// Architecture: Transport Layer
// Dependencies: DashMap, Tokio, Uuid

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::Event;
use crate::observability::KernelMetrics;

/// Process-wide registry of stream connections. Created at boot and shared by handle.
pub struct ConnectionHub {
    scopes: DashMap<String, HashMap<String, Outlet>>,
    buffer: usize,
    metrics: Arc<KernelMetrics>,
}

#[derive(Clone)]
struct Outlet {
    tx: mpsc::Sender<Event>,
    lagged: Arc<Notify>,
}

/// One registered connection. Dropping it removes the registration.
pub struct Connection {
    pub client_id: String,
    pub scope: String,
    pub events: mpsc::Receiver<Event>,
    /// Signalled when an event was dropped because `events` was full.
    /// Holds a permit until awaited, so a drop is never missed.
    pub lagged: Arc<Notify>,
    hub: Arc<ConnectionHub>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.hub.remove(&self.scope, &self.client_id);
    }
}

impl ConnectionHub {
    pub fn new(buffer: usize, metrics: Arc<KernelMetrics>) -> Self {
        Self {
            scopes: DashMap::new(),
            buffer: buffer.max(1),
            metrics,
        }
    }

    pub fn connect(self: &Arc<Self>, scope: &str) -> Connection {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);
        let lagged = Arc::new(Notify::new());
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(client_id.clone(), Outlet { tx, lagged: lagged.clone() });
        self.metrics.connection_opened();
        tracing::info!("Client {} joined conversation {}", client_id, scope);

        Connection {
            client_id,
            scope: scope.to_string(),
            events: rx,
            lagged,
            hub: self.clone(),
        }
    }

    fn remove(&self, scope: &str, client_id: &str) {
        let removed = match self.scopes.get_mut(scope) {
            Some(mut clients) => clients.remove(client_id).is_some(),
            None => false,
        };
        // Drop empty scopes so the map does not grow with every conversation ever seen.
        self.scopes.remove_if(scope, |_, clients| clients.is_empty());

        if removed {
            self.metrics.connection_closed();
            tracing::info!("Client {} left conversation {}", client_id, scope);
        }
    }

    /// Delivers `event` to every connection on its scope. Never blocks; a full
    /// connection misses the event, is flagged as lagged and re-reads the log.
    pub fn dispatch(&self, event: &Event) {
        let targets: Vec<(String, Outlet)> = match self.scopes.get(&event.scope) {
            Some(clients) => clients.iter().map(|(id, o)| (id.clone(), o.clone())).collect(),
            None => return,
        };

        for (client_id, outlet) in targets {
            if let Err(mpsc::error::TrySendError::Full(_)) = outlet.tx.try_send(event.clone()) {
                outlet.lagged.notify_one();
                tracing::warn!(
                    "Client {} is behind on {}; event {} will be replayed",
                    client_id,
                    event.scope,
                    event.id
                );
            }
        }
    }

    /// Pumps the event bus into connections until the bus closes.
    pub fn spawn_fanout(self: &Arc<Self>, mut bus: broadcast::Receiver<Event>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(event) => hub.dispatch(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Fan-out lagged, {} events skipped; clients will re-read", skipped);
                        hub.flag_all_lagged();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Fan-out stopped");
        })
    }

    /// Every connection may have missed something; each re-reads from its cursor.
    fn flag_all_lagged(&self) {
        for clients in self.scopes.iter() {
            for outlet in clients.values() {
                outlet.lagged.notify_one();
            }
        }
    }

    pub fn connection_count(&self, scope: &str) -> usize {
        self.scopes.get(scope).map(|c| c.len()).unwrap_or(0)
    }
}

/// What to do with an incoming live event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admit {
    Deliver,
    /// Already delivered (backlog overlap)
    Skip,
    /// Events after the contained id are missing; re-read them from the log.
    Gap(i64),
}

/// Tracks the last id delivered to one client so catch-up and live delivery stitch
/// together without duplicates or holes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayCursor {
    last: Option<i64>,
}

impl ReplayCursor {
    /// Negative `latest_event_id` means live only: the first live event sets the baseline.
    pub fn new(latest_event_id: i64) -> Self {
        Self {
            last: (latest_event_id >= 0).then_some(latest_event_id),
        }
    }

    pub fn last(&self) -> Option<i64> {
        self.last
    }

    pub fn admit(&self, id: i64) -> Admit {
        match self.last {
            None => Admit::Deliver,
            Some(last) if id <= last => Admit::Skip,
            Some(last) if id == last + 1 => Admit::Deliver,
            Some(last) => Admit::Gap(last),
        }
    }

    pub fn advance(&mut self, id: i64) {
        self.last = Some(self.last.map_or(id, |last| last.max(id)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventDraft, EventKind, EventSource};

    fn event(scope: &str, id: i64) -> Event {
        Event::from_draft(
            id,
            scope,
            EventDraft::new(EventSource::Agent, EventKind::Message, serde_json::json!({})),
            0,
        )
    }

    fn hub() -> Arc<ConnectionHub> {
        Arc::new(ConnectionHub::new(4, Arc::new(KernelMetrics::default())))
    }

    #[tokio::test]
    async fn dispatch_reaches_only_the_events_scope() {
        let hub = hub();
        let mut a1 = hub.connect("a");
        let mut a2 = hub.connect("a");
        let mut b = hub.connect("b");

        hub.dispatch(&event("a", 0));

        assert_eq!(a1.events.recv().await.expect("a1").id, 0);
        assert_eq!(a2.events.recv().await.expect("a2").id, 0);
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_a_connection_unregisters_it() {
        let metrics = Arc::new(KernelMetrics::default());
        let hub = Arc::new(ConnectionHub::new(4, metrics.clone()));
        let first = hub.connect("conv");
        let second = hub.connect("conv");
        assert_eq!(hub.connection_count("conv"), 2);
        assert_eq!(metrics.snapshot().live_connections, 2);

        drop(first);
        assert_eq!(hub.connection_count("conv"), 1);
        drop(second);
        assert_eq!(hub.connection_count("conv"), 0);
        assert_eq!(metrics.snapshot().live_connections, 0);
        // Dispatch to a scope nobody listens on is a no-op.
        hub.dispatch(&event("conv", 1));
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let hub = hub();
        let mut conn = hub.connect("busy");
        for id in 0..10 {
            hub.dispatch(&event("busy", id));
        }
        let mut received = Vec::new();
        while let Ok(e) = conn.events.try_recv() {
            received.push(e.id);
        }
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn overflow_flags_the_connection_as_lagged() {
        let hub = hub();
        let conn = hub.connect("busy");
        for id in 0..4 {
            hub.dispatch(&event("busy", id));
        }
        let quiet = tokio::time::timeout(std::time::Duration::from_millis(20), conn.lagged.notified()).await;
        assert!(quiet.is_err(), "no drop yet");

        hub.dispatch(&event("busy", 4));
        tokio::time::timeout(std::time::Duration::from_secs(1), conn.lagged.notified())
            .await
            .expect("lag signalled");
    }

    #[tokio::test]
    async fn fanout_forwards_bus_events() {
        let hub = hub();
        let (bus, rx) = broadcast::channel(16);
        let mut conn = hub.connect("conv");
        let task = hub.spawn_fanout(rx);

        bus.send(event("conv", 0)).expect("send");
        assert_eq!(conn.events.recv().await.expect("event").id, 0);

        drop(bus);
        task.await.expect("fan-out exits when bus closes");
    }

    #[test]
    fn cursor_skips_backlog_overlap_and_flags_gaps() {
        let mut cursor = ReplayCursor::new(0);
        assert_eq!(cursor.admit(0), Admit::Skip);
        assert_eq!(cursor.admit(1), Admit::Deliver);
        cursor.advance(1);
        assert_eq!(cursor.admit(1), Admit::Skip);
        assert_eq!(cursor.admit(4), Admit::Gap(1));
        cursor.advance(4);
        assert_eq!(cursor.last(), Some(4));
    }

    #[test]
    fn live_only_cursor_accepts_first_event() {
        let mut cursor = ReplayCursor::new(-1);
        assert_eq!(cursor.admit(7), Admit::Deliver);
        cursor.advance(7);
        assert_eq!(cursor.admit(8), Admit::Deliver);
        assert_eq!(cursor.admit(6), Admit::Skip);
    }
}
