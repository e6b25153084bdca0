//! Core domain types shared across every component.
//!
//! Mirrors the teacher's `db/schema.rs` idiom: plain structs, tagged enums
//! with a hand-written `Display`/`FromStr` pair for SQL TEXT round-tripping,
//! and `serde` derives for the wire/REST boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Agent,
    Client,
    Pack,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrincipalKind::Agent => "agent",
            PrincipalKind::Client => "client",
            PrincipalKind::Pack => "pack",
        })
    }
}

impl FromStr for PrincipalKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(PrincipalKind::Agent),
            "client" => Ok(PrincipalKind::Client),
            "pack" => Ok(PrincipalKind::Pack),
            other => Err(format!("unknown principal kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalStatus {
    Pending,
    Approved,
    Revoked,
}

impl fmt::Display for PrincipalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PrincipalStatus::Pending => "pending",
            PrincipalStatus::Approved => "approved",
            PrincipalStatus::Revoked => "revoked",
        })
    }
}

impl FromStr for PrincipalStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PrincipalStatus::Pending),
            "approved" => Ok(PrincipalStatus::Approved),
            "revoked" => Ok(PrincipalStatus::Revoked),
            other => Err(format!("unknown principal status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub kind: PrincipalKind,
    pub fingerprint: String,
    pub display_name: String,
    pub status: PrincipalStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: String,
    pub frontend: String,
    pub channel_id: String,
    pub agent_principal_id: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub frontend: String,
    pub external_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for EventDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventDirection::Inbound => "inbound",
            EventDirection::Outbound => "outbound",
        })
    }
}

impl FromStr for EventDirection {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(EventDirection::Inbound),
            "outbound" => Ok(EventDirection::Outbound),
            other => Err(format!("unknown event direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    ToolCall,
    ToolResult,
    Usage,
    Error,
    System,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Message => "message",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Usage => "usage",
            EventKind::Error => "error",
            EventKind::System => "system",
        })
    }
}

impl FromStr for EventKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(EventKind::Message),
            "tool_call" => Ok(EventKind::ToolCall),
            "tool_result" => Ok(EventKind::ToolResult),
            "usage" => Ok(EventKind::Usage),
            "error" => Ok(EventKind::Error),
            "system" => Ok(EventKind::System),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// An immutable append-only record. Once saved, no field is ever mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: String,
    pub conversation_key: String,
    pub thread_id: Option<String>,
    pub direction: EventDirection,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub text: Option<String>,
    pub raw_tag: Option<String>,
    pub actor_principal_id: Option<String>,
    pub actor_member_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<LedgerEvent>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Auth context injected by the authentication collaborator (out of scope
/// internals; the gateway core only consumes this shape).
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub principal_id: Option<String>,
    pub principal_type: Option<PrincipalKind>,
    pub member_id: Option<String>,
    pub roles: Vec<String>,
}
