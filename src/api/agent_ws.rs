//! The `/ws/agent` duplex endpoint: register, heartbeat, response, and
//! execute_pack_tool handling for both agent and pack connections.
//!
//! Grounded on the tunnel-relay example's connection lifecycle: split the
//! socket, run outbound sends from a queue task, dispatch inbound frames in
//! a loop, and clean up every registry entry on disconnect.

use super::AppState;
use crate::arbiter::QuestionAnswer;
use crate::connection::AgentConnection;
use crate::model::{EventKind, PrincipalKind, PrincipalStatus};
use crate::wire::{AgentMessage, ResponseEvent, ServerMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn agent_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else { continue };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let connection_id = Uuid::new_v4().to_string();
    let mut connection: Option<Arc<AgentConnection>> = None;

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: AgentMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed agent frame");
                continue;
            }
        };

        match (parsed, &connection) {
            (AgentMessage::Register { agent_id, name, capabilities, metadata }, None) => {
                connection = Some(
                    register_connection(&state, &connection_id, agent_id, name, capabilities, metadata, outbound_tx.clone())
                        .await,
                );
                if connection.is_none() {
                    break;
                }
            }
            (AgentMessage::Register { .. }, Some(_)) => {
                tracing::warn!("ignoring duplicate register on an already-registered connection");
            }
            (_, None) => {
                tracing::warn!("closing connection: first agent frame was not register");
                break;
            }
            (other, Some(conn)) => dispatch(&state, conn, other).await,
        }
    }

    if let Some(conn) = connection {
        state.connections.unregister(&conn.connection_id).await;
    }
    outbound_task.abort();
}

async fn register_connection(
    state: &AppState,
    connection_id: &str,
    agent_id: String,
    name: String,
    capabilities: Vec<String>,
    metadata: crate::wire::RegisterMetadata,
    outbound_tx: mpsc::UnboundedSender<ServerMessage>,
) -> Option<Arc<AgentConnection>> {
    let principal_kind = if capabilities.iter().any(|c| c == "pack-runtime") {
        PrincipalKind::Pack
    } else {
        PrincipalKind::Agent
    };

    let principal = match state.db.get_principal(&agent_id) {
        Ok(p) => p,
        Err(_) => match state.db.create_principal(&agent_id, principal_kind, &agent_id, &name, PrincipalStatus::Approved) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to register principal");
                return None;
            }
        },
    };

    let instance_id: String = Uuid::new_v4().to_string().chars().take(8).collect();
    let connection = Arc::new(AgentConnection::new(
        connection_id.to_string(),
        instance_id.clone(),
        principal.id.clone(),
        principal_kind,
        name,
        capabilities,
        metadata.workspaces,
        metadata.working_directory,
        metadata.backend,
        outbound_tx,
    ));

    if state.connections.register(connection.clone()).await.is_err() {
        tracing::warn!(connection_id, "connection id collision on register");
        return None;
    }

    let _ = connection.send_server_message(ServerMessage::Welcome {
        server_id: "gateway".to_string(),
        agent_id: principal.id.clone(),
        instance_id,
        principal_id: principal.id,
        available_tools: vec![],
        mcp_token: None,
        mcp_endpoint: None,
        secrets: Default::default(),
    });

    Some(connection)
}

async fn dispatch(state: &AppState, connection: &Arc<AgentConnection>, message: AgentMessage) {
    match message {
        AgentMessage::Register { .. } => unreachable!("handled by caller"),
        AgentMessage::Heartbeat { .. } => {
            tracing::trace!(connection_id = %connection.connection_id, "heartbeat");
        }
        AgentMessage::Response { request_id, event } => {
            handle_response(state, connection, request_id, event).await;
        }
        AgentMessage::ExecutePackTool { request_id, tool_name, input_json } => {
            let Some(pack) = state.connections.get_any_by_kind(PrincipalKind::Pack).await else {
                let _ = connection.send_server_message(ServerMessage::PackToolResult {
                    request_id,
                    result: crate::wire::PackToolOutcome::Error {
                        error: "no pack runtime connected".to_string(),
                    },
                });
                return;
            };
            let arbiter = state.arbiter.clone();
            let connection = connection.clone();
            tokio::spawn(async move {
                let outcome = arbiter
                    .dispatch_pack_tool(&pack, &tool_name, &input_json, None)
                    .await
                    .unwrap_or(crate::wire::PackToolOutcome::Error {
                        error: "pack dispatch failed".to_string(),
                    });
                let _ = connection.send_server_message(ServerMessage::PackToolResult { request_id, result: outcome });
            });
        }
        AgentMessage::PackToolOutcome { request_id, outcome } => {
            state.arbiter.deliver_pack_tool_outcome(&request_id, outcome).await;
        }
    }
}

struct AskUserPayload {
    question: String,
    options: Vec<String>,
    multi_select: bool,
    header: Option<String>,
    timeout_seconds: Option<u64>,
}

/// `{question, options[], multi_select, header?, timeout_seconds?}` per the
/// `ask_user` tool-call contract.
fn parse_ask_user_payload(input: &serde_json::Value) -> Result<AskUserPayload, String> {
    let question = input
        .get("question")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| "ask_user requires a question".to_string())?
        .to_string();
    let options = input
        .get("options")
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let multi_select = input.get("multi_select").and_then(serde_json::Value::as_bool).unwrap_or(false);
    let header = input.get("header").and_then(serde_json::Value::as_str).map(str::to_string);
    let timeout_seconds = input.get("timeout_seconds").and_then(serde_json::Value::as_u64);
    Ok(AskUserPayload { question, options, multi_select, header, timeout_seconds })
}

/// `ask_user` tool calls are validated, forwarded through the normal
/// response pipeline (so the caller's SSE stream, the ledger, and the
/// broadcaster all see the `tool_use` event as usual), pushed to every chat
/// session subscribed to the agent as a `user_question` envelope, and only
/// then registered with the Arbiter's rendezvous. Every other response event
/// is delivered straight to the waiting request.
async fn handle_response(state: &AppState, connection: &Arc<AgentConnection>, request_id: String, event: ResponseEvent) {
    if let ResponseEvent::ToolUse { id, name, input } = &event {
        if name == "ask_user" {
            let question_id = id.clone();
            let payload = match parse_ask_user_payload(input) {
                Ok(p) => p,
                Err(message) => {
                    connection
                        .deliver_response(
                            &request_id,
                            ResponseEvent::ToolResult {
                                id: question_id,
                                output: serde_json::json!({ "error": message }).to_string(),
                            },
                        )
                        .await;
                    return;
                }
            };
            if let Err(e) = crate::arbiter::validate_options(&payload.options) {
                connection
                    .deliver_response(
                        &request_id,
                        ResponseEvent::ToolResult {
                            id: question_id,
                            output: serde_json::json!({ "error": e.to_string() }).to_string(),
                        },
                    )
                    .await;
                return;
            }

            connection.deliver_response(&request_id, event.clone()).await;

            let agent_id = connection.principal_id.clone();
            let user_question = ServerMessage::UserQuestion {
                question_id: question_id.clone(),
                question: payload.question.clone(),
                options: payload.options.clone(),
                multi_select: payload.multi_select,
                header: payload.header.clone(),
                timeout_seconds: payload.timeout_seconds.unwrap_or(60),
            };
            state
                .conversation
                .publish_system_event(
                    &agent_id,
                    EventKind::ToolCall,
                    serde_json::to_string(&user_question).ok(),
                    Some("user_question".to_string()),
                )
                .await;

            let arbiter = state.arbiter.clone();
            let conn = connection.clone();
            let request_id_clone = request_id.clone();
            tokio::spawn(async move {
                let answer = arbiter
                    .ask_user(
                        &agent_id,
                        &question_id,
                        payload.question,
                        payload.options,
                        payload.multi_select,
                        payload.header,
                        payload.timeout_seconds,
                    )
                    .await
                    .unwrap_or(QuestionAnswer {
                        answered: false,
                        selected: vec![],
                        custom_text: String::new(),
                        reason: "internal_error".to_string(),
                    });
                let output = serde_json::to_string(&answer).unwrap_or_default();
                conn.deliver_response(&request_id_clone, ResponseEvent::ToolResult { id: question_id, output })
                    .await;
            });
            return;
        }
    }
    connection.deliver_response(&request_id, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_ask_user_payload() {
        let input = serde_json::json!({
            "question": "Deploy to prod?",
            "options": ["yes", "no"],
            "multi_select": false,
            "header": "Confirmation",
            "timeout_seconds": 45,
        });
        let payload = parse_ask_user_payload(&input).unwrap();
        assert_eq!(payload.question, "Deploy to prod?");
        assert_eq!(payload.options, vec!["yes".to_string(), "no".to_string()]);
        assert!(!payload.multi_select);
        assert_eq!(payload.header.as_deref(), Some("Confirmation"));
        assert_eq!(payload.timeout_seconds, Some(45));
    }

    #[test]
    fn missing_question_is_rejected() {
        let input = serde_json::json!({ "options": ["yes"] });
        assert!(parse_ask_user_payload(&input).is_err());
    }

    #[test]
    fn missing_options_defaults_to_empty_and_fails_validation() {
        let input = serde_json::json!({ "question": "Proceed?" });
        let payload = parse_ask_user_payload(&input).unwrap();
        assert!(payload.options.is_empty());
        assert!(crate::arbiter::validate_options(&payload.options).is_err());
    }
}
