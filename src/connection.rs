//! Agent Connection Manager: owns every live agent duplex stream, exposes
//! lookups, and brokers per-request response fan-in.
//!
//! Grounded on the teacher's `RuntimeManager` (a `RwLock<HashMap>` registry
//! of live handles) blended with the tunnel-relay example's connection
//! lifecycle (split socket, outbound queue task, per-request channel).

use crate::error::{GatewayError, GatewayResult};
use crate::model::PrincipalKind;
use crate::wire::{Attachment, ResponseEvent, ServerMessage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AgentSummary {
    pub connection_id: String,
    pub instance_id: String,
    pub principal_id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub workspaces: Vec<String>,
    pub working_dir: String,
    pub backend: Option<String>,
}

/// A live duplex session with an approved agent principal.
pub struct AgentConnection {
    pub connection_id: String,
    pub instance_id: String,
    pub principal_id: String,
    pub principal_kind: PrincipalKind,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub workspaces: Vec<String>,
    pub working_dir: String,
    pub backend: Option<String>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pending: RwLock<HashMap<String, mpsc::Sender<ResponseEvent>>>,
}

impl AgentConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: String,
        instance_id: String,
        principal_id: String,
        principal_kind: PrincipalKind,
        display_name: String,
        capabilities: Vec<String>,
        workspaces: Vec<String>,
        working_dir: String,
        backend: Option<String>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            connection_id,
            instance_id,
            principal_id,
            principal_kind,
            display_name,
            capabilities,
            workspaces,
            working_dir,
            backend,
            outbound,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            connection_id: self.connection_id.clone(),
            instance_id: self.instance_id.clone(),
            principal_id: self.principal_id.clone(),
            display_name: self.display_name.clone(),
            capabilities: self.capabilities.clone(),
            workspaces: self.workspaces.clone(),
            working_dir: self.working_dir.clone(),
            backend: self.backend.clone(),
        }
    }

    /// Route an inbound agent response to the waiting request, if any.
    /// Returns false if there was no such pending request (stale/unknown).
    pub async fn deliver_response(&self, request_id: &str, event: ResponseEvent) -> bool {
        let sender = self.pending.read().await.get(request_id).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    pub fn send_server_message(&self, msg: ServerMessage) -> GatewayResult<()> {
        self.outbound
            .send(msg)
            .map_err(|_| GatewayError::Transport(format!("connection {} closed", self.connection_id)))
    }

    async fn install_pending(&self, request_id: &str, capacity: usize) -> mpsc::Receiver<ResponseEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        self.pending.write().await.insert(request_id.to_string(), tx);
        rx
    }

    async fn remove_pending(&self, request_id: &str) {
        self.pending.write().await.remove(request_id);
    }
}

fn is_terminal(event: &ResponseEvent) -> bool {
    matches!(
        event,
        ResponseEvent::Done { .. } | ResponseEvent::Error { .. } | ResponseEvent::Cancelled
    )
}

pub struct SendMessageRequest {
    pub thread_id: String,
    pub sender: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
}

/// Registry of live agent connections, keyed by connection id.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<AgentConnection>>>,
    response_channel_capacity: usize,
    request_seq: AtomicU64,
}

impl ConnectionManager {
    pub fn new(response_channel_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            response_channel_capacity,
            request_seq: AtomicU64::new(0),
        }
    }

    /// Rejects a second registration for a principal/working-dir pair that
    /// already has a live connection (at most one live connection per
    /// (principal id, working dir)).
    pub async fn register(&self, connection: Arc<AgentConnection>) -> GatewayResult<()> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&connection.connection_id)
            || connections
                .values()
                .any(|c| c.principal_id == connection.principal_id && c.working_dir == connection.working_dir)
        {
            return Err(GatewayError::AlreadyExists(connection.principal_id.clone()));
        }
        connections.insert(connection.connection_id.clone(), connection);
        Ok(())
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn get_by_instance_id(&self, instance_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.instance_id == instance_id)
            .cloned()
    }

    /// The key the Binding Resolver path uses: at most one live connection
    /// per (principal, working dir).
    pub async fn get_by_principal_and_workdir(
        &self,
        principal_id: &str,
        working_dir: &str,
    ) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.principal_id == principal_id && c.working_dir == working_dir)
            .cloned()
    }

    /// Any live connection for a principal, used by direct-send-by-agent-id
    /// callers that don't care which working dir answers.
    pub async fn get_by_principal(&self, principal_id: &str) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.principal_id == principal_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<AgentSummary> {
        self.connections.read().await.values().map(|c| c.summary()).collect()
    }

    /// Any live connection registered as the given principal kind. Used by
    /// the Arbiter to find a pack-runtime connection to route
    /// `execute_pack_tool` calls to; this gateway assumes a single-process
    /// deployment so picking any available match is sufficient.
    pub async fn get_any_by_kind(&self, kind: PrincipalKind) -> Option<Arc<AgentConnection>> {
        self.connections
            .read()
            .await
            .values()
            .find(|c| c.principal_kind == kind)
            .cloned()
    }

    pub async fn is_online(&self, principal_id: &str) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|c| c.principal_id == principal_id)
    }

    fn next_request_id(&self) -> String {
        let n = self.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("req-{}-{}", uuid::Uuid::new_v4(), n)
    }

    /// Dispatch a message to `connection` and return the freshly minted
    /// request id along with a stream of response events that terminates on
    /// the connection's first terminal event or on cancellation.
    pub async fn send_message(
        &self,
        connection: &Arc<AgentConnection>,
        req: SendMessageRequest,
        cancel: CancellationToken,
    ) -> GatewayResult<(String, ReceiverStream<ResponseEvent>)> {
        let request_id = self.next_request_id();
        let inbound_rx = connection
            .install_pending(&request_id, self.response_channel_capacity)
            .await;

        if let Err(e) = connection.send_server_message(ServerMessage::SendMessage {
            request_id: request_id.clone(),
            thread_id: req.thread_id,
            sender: req.sender,
            content: req.content,
            attachments: req.attachments,
        }) {
            connection.remove_pending(&request_id).await;
            return Err(e);
        }

        let (out_tx, out_rx) = mpsc::channel(self.response_channel_capacity);
        let connection = connection.clone();
        let request_id_for_task = request_id.clone();
        tokio::spawn(async move {
            let mut inbound_rx = inbound_rx;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = out_tx.send(ResponseEvent::Cancelled).await;
                        break;
                    }
                    maybe_event = inbound_rx.recv() => {
                        match maybe_event {
                            Some(event) => {
                                let terminal = is_terminal(&event);
                                if out_tx.send(event).await.is_err() {
                                    break;
                                }
                                if terminal {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            connection.remove_pending(&request_id_for_task).await;
        });

        Ok((request_id, ReceiverStream::new(out_rx)))
    }
}
