//! Request and response DTOs for the REST/SSE façade.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SendRequestBody {
    pub thread_id: Option<String>,
    pub frontend: Option<String>,
    pub channel_id: Option<String>,
    pub agent_id: Option<String>,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    /// Bridge-supplied message id, e.g. a Slack `ts`. Dedup key is
    /// `bridge:<frontend>:<platform_message_id>`, distinct from
    /// `idempotency_key`'s `client:` boundary; only meaningful alongside
    /// `frontend`/`channel_id`.
    #[serde(default)]
    pub platform_message_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentSummaryResponse {
    pub connection_id: String,
    pub instance_id: String,
    pub principal_id: String,
    pub display_name: String,
    pub capabilities: Vec<String>,
    pub workspaces: Vec<String>,
    pub working_dir: String,
}

impl From<crate::connection::AgentSummary> for AgentSummaryResponse {
    fn from(s: crate::connection::AgentSummary) -> Self {
        Self {
            connection_id: s.connection_id,
            instance_id: s.instance_id,
            principal_id: s.principal_id,
            display_name: s.display_name,
            capabilities: s.capabilities,
            workspaces: s.workspaces,
            working_dir: s.working_dir,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBindingBody {
    pub frontend: String,
    pub channel_id: String,
    pub instance_id: String,
    pub working_dir: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BindingResponse {
    pub id: String,
    pub frontend: String,
    pub channel_id: String,
    pub agent_principal_id: String,
    pub working_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebound_from: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub id: String,
    pub conversation_key: String,
    pub thread_id: Option<String>,
    pub direction: String,
    pub author: String,
    pub timestamp: String,
    pub kind: String,
    pub text: Option<String>,
}

impl From<crate::model::LedgerEvent> for EventResponse {
    fn from(e: crate::model::LedgerEvent) -> Self {
        Self {
            id: e.id,
            conversation_key: e.conversation_key,
            thread_id: e.thread_id,
            direction: e.direction.to_string(),
            author: e.author,
            timestamp: e.timestamp.to_rfc3339(),
            kind: e.kind.to_string(),
            text: e.text,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventPageResponse {
    pub events: Vec<EventResponse>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

impl From<crate::model::EventPage> for EventPageResponse {
    fn from(p: crate::model::EventPage) -> Self {
        Self {
            events: p.events.into_iter().map(EventResponse::from).collect(),
            has_more: p.has_more,
            next_cursor: p.next_cursor,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ApproveToolBody {
    pub agent_id: String,
    pub tool_id: String,
    pub approved: bool,
    #[serde(default)]
    pub approve_all: bool,
}

#[derive(Debug, Deserialize)]
pub struct AnswerQuestionBody {
    pub agent_id: String,
    pub question_id: String,
    #[serde(default)]
    pub selected: Vec<String>,
    pub custom_text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
