//! Gateway-wide error taxonomy.
//!
//! Every component returns `GatewayError` so the two external boundaries
//! (REST in `api::handlers`, the agent wire protocol in `wire`) can adapt a
//! single taxonomy instead of inventing their own per-layer status codes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("agent offline: {0}")]
    AgentOffline(String),

    #[error("channel not bound: {frontend}/{channel_id}")]
    ChannelNotBound { frontend: String, channel_id: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Db(#[from] crate::db::DbError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Coarse kind used by both the REST and wire adapters to pick a status.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidArgument(_) => ErrorKind::ClientFault,
            GatewayError::NotFound(_) => ErrorKind::NotFound,
            GatewayError::AlreadyExists(_) => ErrorKind::Conflict,
            GatewayError::ChannelNotBound { .. } => ErrorKind::NotFound,
            GatewayError::AgentOffline(_) => ErrorKind::Precondition,
            GatewayError::Db(e) => db_error_kind(e),
            GatewayError::Transport(_) | GatewayError::Serde(_) => ErrorKind::Internal,
            GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientFault,
    NotFound,
    Conflict,
    Precondition,
    Internal,
}

/// `*NotFound` variants are client-visible 404s, `Duplicate*` are 409s;
/// everything else (the sqlite driver itself misbehaving) is a 500.
fn db_error_kind(e: &crate::db::DbError) -> ErrorKind {
    use crate::db::DbError;
    match e {
        DbError::PrincipalNotFound(_) | DbError::BindingNotFound(_) | DbError::ThreadNotFound(_) => {
            ErrorKind::NotFound
        }
        DbError::DuplicatePubkey(_) | DbError::DuplicateChannel(_, _) | DbError::DuplicateEvent(_) => {
            ErrorKind::Conflict
        }
        DbError::Sqlite(_) => ErrorKind::Internal,
    }
}
