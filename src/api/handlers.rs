//! REST handlers for the frontend-facing façade.

use super::agent_ws::agent_socket;
use super::sse::sse_stream;
use super::types::{
    AgentSummaryResponse, AnswerQuestionBody, ApproveToolBody, BindingResponse, CreateBindingBody,
    ErrorBody, EventPageResponse, HistoryQuery, SendRequestBody,
};
use super::AppState;
use crate::conversation::SendRequest;
use crate::error::{ErrorKind, GatewayError};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppError(GatewayError);

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        AppError(e)
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(e: crate::db::DbError) -> Self {
        AppError(GatewayError::Db(e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::ClientFault => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Precondition => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => {
                tracing::error!(error = %self.0, "internal error serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match self.0.kind() {
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/send", post(send_message))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id/send", post(send_to_agent))
        .route("/api/agents/:id/history", get(agent_history))
        .route("/api/bindings", get(list_bindings).post(create_binding).delete(delete_binding))
        .route("/api/threads/:id/messages", get(thread_messages))
        .route("/api/tools/approve", post(approve_tool))
        .route("/api/questions/answer", post(answer_question))
        .route("/ws/agent", get(agent_socket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendRequestBody>,
) -> Result<Response, AppError> {
    if let Some(key) = &body.idempotency_key {
        if key.len() > 100 {
            return Err(GatewayError::InvalidArgument("idempotency_key too long".into()).into());
        }
        let dedup_key = format!("client:{key}");
        if state.dedup.check(&dedup_key) {
            return Ok((StatusCode::OK, Json(serde_json::json!({ "status": "duplicate" }))).into_response());
        }
        state.dedup.mark(&dedup_key);
    }

    // Bridge boundary: duplicate detection is silent (success, no dispatch),
    // unlike idempotency_key's distinguished "duplicate" status. Marked only
    // after a successful dispatch so a transient failure allows retry.
    let bridge_dedup_key = match (&body.frontend, &body.platform_message_id) {
        (Some(frontend), Some(platform_message_id)) => {
            let key = format!("bridge:{frontend}:{platform_message_id}");
            if state.dedup.check(&key) {
                return Ok((StatusCode::OK, Json(serde_json::json!({ "status": "ok" }))).into_response());
            }
            Some(key)
        }
        _ => None,
    };

    let (agent_id, thread_id) = resolve_agent_and_thread(&state, &body)?;

    let outcome = state
        .conversation
        .send_message(
            SendRequest {
                thread_id,
                frontend_name: body.frontend.clone(),
                external_id: body.channel_id.clone(),
                agent_id,
                sender: body.sender,
                content: body.content,
                attachments: vec![],
                actor_principal_id: None,
                actor_member_id: None,
            },
            tokio_util::sync::CancellationToken::new(),
        )
        .await?;

    if let Some(key) = bridge_dedup_key {
        state.dedup.mark(&key);
    }

    Ok(sse_stream(outcome.thread_id, outcome.stream).into_response())
}

fn resolve_agent_and_thread(
    state: &AppState,
    body: &SendRequestBody,
) -> Result<(String, Option<String>), AppError> {
    if let Some(agent_id) = &body.agent_id {
        return Ok((agent_id.clone(), body.thread_id.clone()));
    }
    let (frontend, channel_id) = match (&body.frontend, &body.channel_id) {
        (Some(f), Some(c)) => (f, c),
        _ => {
            return Err(GatewayError::InvalidArgument(
                "either agent_id or frontend+channel_id is required".into(),
            )
            .into())
        }
    };
    let resolved = state.resolver.resolve(frontend, channel_id, body.thread_id.as_deref())?;
    Ok((resolved.agent_principal_id, Some(resolved.thread_id)))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummaryResponse>> {
    let agents = state.connections.list().await;
    Json(agents.into_iter().map(AgentSummaryResponse::from).collect())
}

async fn send_to_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<SendRequestBody>,
) -> Result<Response, AppError> {
    let outcome = state
        .conversation
        .send_message(
            SendRequest {
                thread_id: body.thread_id,
                frontend_name: None,
                external_id: None,
                agent_id,
                sender: body.sender,
                content: body.content,
                attachments: vec![],
                actor_principal_id: None,
                actor_member_id: None,
            },
            tokio_util::sync::CancellationToken::new(),
        )
        .await?;
    Ok(sse_stream(outcome.thread_id, outcome.stream).into_response())
}

async fn agent_history(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<EventPageResponse>, AppError> {
    let limit = query.limit.unwrap_or(100).min(500);
    let page = state
        .conversation
        .ledger()
        .get_events(&agent_id, None, limit, query.cursor.as_deref())?;
    Ok(Json(page.into()))
}

async fn list_bindings(State(state): State<AppState>) -> Result<Json<Vec<BindingResponse>>, AppError> {
    let bindings = state.db.list_bindings()?;
    Ok(Json(
        bindings
            .into_iter()
            .map(|b| BindingResponse {
                id: b.id,
                frontend: b.frontend,
                channel_id: b.channel_id,
                agent_principal_id: b.agent_principal_id,
                working_dir: b.working_dir,
                rebound_from: None,
            })
            .collect(),
    ))
}

async fn create_binding(
    State(state): State<AppState>,
    Json(body): Json<CreateBindingBody>,
) -> Result<(StatusCode, Json<BindingResponse>), AppError> {
    let connection = state
        .connections
        .get_by_instance_id(&body.instance_id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("agent instance {}", body.instance_id)))?;
    let working_dir = body.working_dir.unwrap_or_else(|| connection.working_dir.clone());

    let id = uuid::Uuid::new_v4().to_string();
    let (binding, rebound_from) = state.db.upsert_binding(
        &id,
        &body.frontend,
        &body.channel_id,
        &connection.principal_id,
        &working_dir,
        body.created_by.as_deref(),
    )?;

    let status = if rebound_from.is_some() { StatusCode::OK } else { StatusCode::CREATED };
    Ok((
        status,
        Json(BindingResponse {
            id: binding.id,
            frontend: binding.frontend,
            channel_id: binding.channel_id,
            agent_principal_id: binding.agent_principal_id,
            working_dir: binding.working_dir,
            rebound_from,
        }),
    ))
}

#[derive(serde::Deserialize)]
struct DeleteBindingQuery {
    frontend: String,
    channel_id: String,
}

async fn delete_binding(
    State(state): State<AppState>,
    Query(query): Query<DeleteBindingQuery>,
) -> Result<StatusCode, AppError> {
    state.db.delete_binding(&query.frontend, &query.channel_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn thread_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<super::types::EventResponse>>, AppError> {
    let limit = query.limit.unwrap_or(200).min(1000);
    // Confirm the thread exists so unknown ids surface as 404 rather than an
    // empty-but-successful page.
    state.db.get_thread(&thread_id)?;
    let events = state.conversation.ledger().get_events_by_thread(&thread_id, limit)?;
    Ok(Json(events.into_iter().map(super::types::EventResponse::from).collect()))
}

async fn approve_tool(
    State(state): State<AppState>,
    Json(body): Json<ApproveToolBody>,
) -> Result<StatusCode, AppError> {
    let connection = state
        .connections
        .get_by_principal(&body.agent_id)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("agent {}", body.agent_id)))?;
    state
        .arbiter
        .relay_tool_approval(&connection, &body.tool_id, body.approved, body.approve_all)?;
    Ok(StatusCode::OK)
}

async fn answer_question(
    State(state): State<AppState>,
    Json(body): Json<AnswerQuestionBody>,
) -> Result<StatusCode, AppError> {
    state
        .arbiter
        .answer_question(&body.agent_id, &body.question_id, body.selected, body.custom_text)
        .await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::connection::AgentConnection;
    use crate::db::Database;
    use crate::model::PrincipalKind;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(Database::open_in_memory().unwrap(), GatewayConfig::from_env())
    }

    async fn register_online_agent(state: &AppState, agent_id: &str) {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let conn = Arc::new(AgentConnection::new(
            format!("conn-{agent_id}"),
            format!("inst-{agent_id}"),
            agent_id.to_string(),
            PrincipalKind::Agent,
            "Agent".to_string(),
            vec![],
            vec![],
            "/w".to_string(),
            None,
            tx,
        ));
        state.connections.register(conn).await.unwrap();
    }

    #[tokio::test]
    async fn list_agents_empty_by_default() {
        let app = create_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/agents").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn send_without_target_is_bad_request() {
        let app = create_router(test_state());
        let body = serde_json::json!({ "sender": "user", "content": "hi" });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/send")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn send_offline_agent_is_service_unavailable() {
        let app = create_router(test_state());
        let body = serde_json::json!({ "sender": "user", "content": "hi", "agent_id": "ghost" });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/send")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn create_binding_unknown_instance_is_not_found() {
        let app = create_router(test_state());
        let body = serde_json::json!({
            "frontend": "matrix",
            "channel_id": "!room",
            "instance_id": "missing",
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/bindings")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn duplicate_bridge_message_is_suppressed_silently() {
        let state = test_state();
        register_online_agent(&state, "agent-1").await;
        let app = create_router(state);

        let body = serde_json::json!({
            "sender": "user",
            "content": "hi",
            "agent_id": "agent-1",
            "frontend": "slack",
            "platform_message_id": "ts1",
        });
        let send = || {
            Request::builder()
                .method("POST")
                .uri("/api/send")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let first = app.clone().oneshot(send()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(send()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
    }
}
