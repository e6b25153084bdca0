//! Agent wire protocol: the JSON envelopes exchanged over the `/ws/agent`
//! duplex stream. Modeled on the tunnel-relay convention of one internally
//! tagged enum per direction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMetadata {
    #[serde(default)]
    pub workspaces: Vec<String>,
    pub working_directory: String,
    #[serde(default)]
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register {
        agent_id: String,
        name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        metadata: RegisterMetadata,
    },
    Heartbeat {
        timestamp_ms: i64,
    },
    Response {
        request_id: String,
        #[serde(flatten)]
        event: ResponseEvent,
    },
    ExecutePackTool {
        request_id: String,
        tool_name: String,
        input_json: String,
    },
    /// Sent by a pack connection in answer to `ServerMessage::InvokePackTool`.
    PackToolOutcome {
        request_id: String,
        #[serde(flatten)]
        outcome: PackToolOutcome,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseEvent {
    Thinking { text: String },
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { id: String, output: String },
    File { name: String, mime_type: String, data_base64: String },
    Usage { input_tokens: u64, output_tokens: u64 },
    ToolState { id: String, state: String },
    ToolApprovalRequest { tool_id: String, tool_name: String, input: serde_json::Value },
    SessionInit { session_id: String },
    SessionOrphaned { reason: String },
    Cancelled,
    Done { text: String },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub data_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        server_id: String,
        agent_id: String,
        instance_id: String,
        principal_id: String,
        #[serde(default)]
        available_tools: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mcp_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mcp_endpoint: Option<String>,
        #[serde(default)]
        secrets: HashMap<String, String>,
    },
    SendMessage {
        request_id: String,
        thread_id: String,
        sender: String,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    PackToolResult {
        request_id: String,
        #[serde(flatten)]
        result: PackToolOutcome,
    },
    ToolApprovalResponse {
        tool_id: String,
        approved: bool,
        approve_all: bool,
    },
    UserQuestion {
        question_id: String,
        question: String,
        options: Vec<String>,
        multi_select: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        timeout_seconds: u64,
    },
    /// Sent to a pack connection to invoke one of its tools on behalf of an
    /// agent's `execute_pack_tool` request.
    InvokePackTool {
        request_id: String,
        tool_name: String,
        input_json: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PackToolOutcome {
    Output { output_json: String },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trips() {
        let msg = AgentMessage::Register {
            agent_id: "a1".into(),
            name: "Agent One".into(),
            capabilities: vec!["bash".into()],
            metadata: RegisterMetadata {
                workspaces: vec!["/w".into()],
                working_directory: "/w".into(),
                backend: Some("claude".into()),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"register\""));
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        match back {
            AgentMessage::Register { agent_id, .. } => assert_eq!(agent_id, "a1"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_done_round_trips() {
        let msg = AgentMessage::Response {
            request_id: "r1".into(),
            event: ResponseEvent::Done { text: "Hello".into() },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        match back {
            AgentMessage::Response { request_id, event: ResponseEvent::Done { text } } => {
                assert_eq!(request_id, "r1");
                assert_eq!(text, "Hello");
            }
            _ => panic!("wrong variant"),
        }
    }
}
