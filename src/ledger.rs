//! Event Ledger & Broadcaster: durable append-only storage (delegated to
//! [`crate::db::Database`]) paired with the live fan-out side.
//!
//! Redesign from the teacher's SSE broadcast handling: a lagged subscriber
//! is dropped (its stream ends) rather than silently skipping the events it
//! missed, so a viewer never mistakes a gap for a quiet conversation.

use crate::db::Database;
use crate::model::{EventPage, LedgerEvent};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;

/// Durable half: thin wrapper over [`Database`] so callers depend on one
/// small trait-shaped surface instead of the full storage API.
#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn save_event(&self, event: &LedgerEvent) -> crate::db::DbResult<()> {
        self.db.save_event(event)
    }

    pub fn get_events(
        &self,
        conversation_key: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> crate::db::DbResult<EventPage> {
        self.db.get_events(conversation_key, since, limit, cursor)
    }

    pub fn get_events_by_thread(&self, thread_id: &str, limit: usize) -> crate::db::DbResult<Vec<LedgerEvent>> {
        self.db.get_events_by_thread(thread_id, limit)
    }
}

/// Live fan-out side. One broadcast channel per conversation key, created
/// lazily on first subscribe or publish.
pub struct Broadcaster {
    channels: RwLock<HashMap<String, broadcast::Sender<LedgerEvent>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            capacity,
        })
    }

    async fn sender_for(&self, conversation_key: &str) -> broadcast::Sender<LedgerEvent> {
        if let Some(tx) = self.channels.read().await.get(conversation_key) {
            return tx.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(conversation_key.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe returns a stream that yields every event published under
    /// `conversation_key` after this call returns, and ends (rather than
    /// skipping) if the subscriber falls behind the buffer.
    pub async fn subscribe(
        &self,
        conversation_key: &str,
    ) -> Pin<Box<dyn Stream<Item = LedgerEvent> + Send>> {
        let tx = self.sender_for(conversation_key).await;
        let rx = tx.subscribe();
        let stream = BroadcastStream::new(rx).take_while(|item| {
            !matches!(item, Err(BroadcastStreamRecvError::Lagged(_)))
        });
        Box::pin(stream.filter_map(|item| item.ok()))
    }

    /// Non-blocking; if no subscribers exist yet this is a no-op (the
    /// channel is created lazily by `subscribe`, so early publishes before
    /// any viewer attaches are simply not replayed — callers that need
    /// replay-from-start should read the durable ledger first).
    pub async fn publish(&self, event: LedgerEvent) {
        let tx = self.sender_for(&event.conversation_key).await;
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventDirection, EventKind};

    fn event(key: &str, id: &str) -> LedgerEvent {
        LedgerEvent {
            id: id.to_string(),
            conversation_key: key.to_string(),
            thread_id: None,
            direction: EventDirection::Outbound,
            author: "agent".into(),
            timestamp: Utc::now(),
            kind: EventKind::Message,
            text: Some("hi".into()),
            raw_tag: None,
            actor_principal_id: None,
            actor_member_id: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let broadcaster = Broadcaster::new(8);
        let mut stream = broadcaster.subscribe("agent-a").await;
        broadcaster.publish(event("agent-a", "e1")).await;

        use futures::StreamExt;
        let received = stream.next().await.unwrap();
        assert_eq!(received.id, "e1");
    }

    #[tokio::test]
    async fn lagged_subscriber_stream_ends() {
        let broadcaster = Broadcaster::new(2);
        let mut stream = broadcaster.subscribe("agent-a").await;
        for i in 0..10 {
            broadcaster.publish(event("agent-a", &format!("e{i}"))).await;
        }
        use futures::StreamExt;
        // Drains whatever is buffered, then the lag gap must terminate the
        // stream rather than silently resuming mid-sequence.
        while stream.next().await.is_some() {}
    }
}
