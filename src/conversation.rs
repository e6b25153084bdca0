//! Conversation Service: the canonical send pipeline. Every inbound message
//! flows through [`ConversationService::send_message`] so persistence,
//! routing, and broadcast happen exactly once and in a fixed order.

use crate::connection::{ConnectionManager, SendMessageRequest};
use crate::db::Database;
use crate::error::{GatewayError, GatewayResult};
use crate::ledger::{Broadcaster, Ledger};
use crate::model::{EventDirection, EventKind, LedgerEvent};
use crate::wire::{Attachment, ResponseEvent};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SendRequest {
    pub thread_id: Option<String>,
    pub frontend_name: Option<String>,
    pub external_id: Option<String>,
    pub agent_id: String,
    pub sender: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub actor_principal_id: Option<String>,
    pub actor_member_id: Option<String>,
}

pub struct SendOutcome {
    pub thread_id: String,
    pub request_id: String,
    pub stream: Pin<Box<dyn Stream<Item = ResponseEvent> + Send>>,
}

#[derive(Clone)]
pub struct ConversationService {
    db: Database,
    ledger: Ledger,
    broadcaster: Arc<Broadcaster>,
    connections: Arc<ConnectionManager>,
}

impl ConversationService {
    pub fn new(db: Database, broadcaster: Arc<Broadcaster>, connections: Arc<ConnectionManager>) -> Self {
        let ledger = Ledger::new(db.clone());
        Self {
            db,
            ledger,
            broadcaster,
            connections,
        }
    }

    /// Persist and broadcast a gateway-originated event that isn't part of
    /// an agent's per-request response stream (e.g. a pushed `user_question`
    /// envelope), following the same append-then-publish order as
    /// `persist_if_complete`.
    pub async fn publish_system_event(
        &self,
        conversation_key: &str,
        kind: EventKind,
        text: Option<String>,
        raw_tag: Option<String>,
    ) {
        let event = LedgerEvent {
            id: Uuid::new_v4().to_string(),
            conversation_key: conversation_key.to_string(),
            thread_id: None,
            direction: EventDirection::Outbound,
            author: conversation_key.to_string(),
            timestamp: chrono::Utc::now(),
            kind,
            text,
            raw_tag,
            actor_principal_id: None,
            actor_member_id: None,
        };
        if self.ledger.save_event(&event).is_ok() {
            self.broadcaster.publish(event).await;
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub async fn send_message(&self, req: SendRequest, cancel: CancellationToken) -> GatewayResult<SendOutcome> {
        let thread_id = match &req.thread_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => crate::resolver::BindingResolver::direct_thread_id(&req.agent_id),
        };

        if let (Some(frontend), Some(external_id)) = (&req.frontend_name, &req.external_id) {
            // Idempotent: creates the thread row on first contact, reuses it after.
            self.db
                .get_or_create_thread(frontend, external_id, &req.agent_id, &thread_id)?;
        }

        let inbound_id = Uuid::new_v4().to_string();
        let inbound_event = LedgerEvent {
            id: inbound_id,
            conversation_key: req.agent_id.clone(),
            thread_id: Some(thread_id.clone()),
            direction: EventDirection::Inbound,
            author: req.sender.clone(),
            timestamp: chrono::Utc::now(),
            kind: EventKind::Message,
            text: Some(req.content.clone()),
            raw_tag: None,
            actor_principal_id: req.actor_principal_id.clone(),
            actor_member_id: req.actor_member_id.clone(),
        };
        self.ledger.save_event(&inbound_event)?;
        self.broadcaster.publish(inbound_event).await;

        let connection = self
            .connections
            .get_by_principal(&req.agent_id)
            .await
            .ok_or_else(|| GatewayError::AgentOffline(req.agent_id.clone()))?;

        let (request_id, agent_stream) = self
            .connections
            .send_message(
                &connection,
                SendMessageRequest {
                    thread_id: thread_id.clone(),
                    sender: req.sender.clone(),
                    content: req.content.clone(),
                    attachments: req.attachments,
                },
                cancel,
            )
            .await?;

        let (caller_tx, caller_rx) = tokio::sync::mpsc::channel(32);
        let conversation_key = req.agent_id.clone();
        let thread_id_for_task = thread_id.clone();
        let ledger = self.ledger.clone();
        let broadcaster = self.broadcaster.clone();

        tokio::spawn(async move {
            use futures::StreamExt;
            let mut agent_stream = agent_stream;
            while let Some(event) = agent_stream.next().await {
                persist_if_complete(&ledger, &broadcaster, &conversation_key, &thread_id_for_task, &event).await;
                if caller_tx.send(event).await.is_err() {
                    // Caller abandoned the stream; persistence keeps running.
                    continue;
                }
            }
        });

        Ok(SendOutcome {
            thread_id,
            request_id,
            stream: Box::pin(tokio_stream::wrappers::ReceiverStream::new(caller_rx)),
        })
    }
}

/// Only semantically-complete response events are written to the ledger;
/// `thinking`/`text` chunks, `usage`, `file`, `tool_state`, and session
/// lifecycle events are forwarded live but never persisted.
async fn persist_if_complete(
    ledger: &Ledger,
    broadcaster: &Broadcaster,
    conversation_key: &str,
    thread_id: &str,
    event: &ResponseEvent,
) {
    let (kind, text, raw_tag) = match event {
        ResponseEvent::Done { text } => (EventKind::Message, Some(text.clone()), None),
        ResponseEvent::ToolUse { id, name, input } => (
            EventKind::ToolCall,
            Some(serde_json::json!({"id": id, "name": name, "input": input}).to_string()),
            Some("tool_use".to_string()),
        ),
        ResponseEvent::ToolResult { id, output } => (
            EventKind::ToolResult,
            Some(serde_json::json!({"id": id, "output": output}).to_string()),
            Some("tool_result".to_string()),
        ),
        ResponseEvent::Error { message } => (EventKind::Error, Some(message.clone()), None),
        ResponseEvent::Cancelled => (EventKind::Error, Some("cancelled".to_string()), None),
        _ => return,
    };

    let persisted = LedgerEvent {
        id: Uuid::new_v4().to_string(),
        conversation_key: conversation_key.to_string(),
        thread_id: Some(thread_id.to_string()),
        direction: EventDirection::Outbound,
        author: conversation_key.to_string(),
        timestamp: chrono::Utc::now(),
        kind,
        text,
        raw_tag,
        actor_principal_id: None,
        actor_member_id: None,
    };
    if ledger.save_event(&persisted).is_ok() {
        broadcaster.publish(persisted).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrincipalKind, PrincipalStatus};
    use crate::wire::ServerMessage;
    use tokio::sync::mpsc;

    async fn setup() -> (ConversationService, Arc<ConnectionManager>, Arc<crate::connection::AgentConnection>, mpsc::UnboundedReceiver<ServerMessage>) {
        let db = Database::open_in_memory().unwrap();
        db.create_principal("agent-a", PrincipalKind::Agent, "fp1", "Agent A", PrincipalStatus::Approved)
            .unwrap();
        let connections = Arc::new(ConnectionManager::new(16));
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(crate::connection::AgentConnection::new(
            "c1".into(),
            "inst-1".into(),
            "agent-a".into(),
            PrincipalKind::Agent,
            "Agent A".into(),
            vec![],
            vec![],
            "/w".into(),
            None,
            tx,
        ));
        connections.register(conn.clone()).await.unwrap();
        let broadcaster = Broadcaster::new(16);
        let service = ConversationService::new(db, broadcaster, connections.clone());
        (service, connections, conn, rx)
    }

    #[tokio::test]
    async fn send_message_persists_inbound_and_streams_responses() {
        let (service, _connections, conn, mut outbound) = setup().await;

        let outcome = service
            .send_message(
                SendRequest {
                    thread_id: None,
                    frontend_name: None,
                    external_id: None,
                    agent_id: "agent-a".into(),
                    sender: "user".into(),
                    content: "hi".into(),
                    attachments: vec![],
                    actor_principal_id: None,
                    actor_member_id: None,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.thread_id, "agent-a");

        let request_id = match outbound.recv().await.unwrap() {
            ServerMessage::SendMessage { request_id, content, .. } => {
                assert_eq!(content, "hi");
                request_id
            }
            _ => panic!("expected send_message"),
        };

        conn.deliver_response(&request_id, ResponseEvent::Done { text: "Hello".into() })
            .await;

        use futures::StreamExt;
        let mut stream = outcome.stream;
        let event = stream.next().await.unwrap();
        assert!(matches!(event, ResponseEvent::Done { .. }));

        // Give the spawned persister a beat to finish writing.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let page = service.ledger().get_events("agent-a", None, 10, None).unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].direction, EventDirection::Inbound);
        assert_eq!(page.events[1].direction, EventDirection::Outbound);
    }

    #[tokio::test]
    async fn send_message_offline_agent_still_persists_inbound() {
        let db = Database::open_in_memory().unwrap();
        db.create_principal("agent-b", PrincipalKind::Agent, "fp2", "Agent B", PrincipalStatus::Approved)
            .unwrap();
        let connections = Arc::new(ConnectionManager::new(16));
        let broadcaster = Broadcaster::new(16);
        let service = ConversationService::new(db, broadcaster, connections);

        let err = service
            .send_message(
                SendRequest {
                    thread_id: None,
                    frontend_name: None,
                    external_id: None,
                    agent_id: "agent-b".into(),
                    sender: "user".into(),
                    content: "hi".into(),
                    attachments: vec![],
                    actor_principal_id: None,
                    actor_member_id: None,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::AgentOffline(_)));
        let page = service.ledger().get_events("agent-b", None, 10, None).unwrap();
        assert_eq!(page.events.len(), 1);
    }
}
