//! HTTP API: the REST/SSE façade and the agent websocket endpoint.

mod agent_ws;
mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::arbiter::{Arbiter, ArbiterConfig};
use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::conversation::ConversationService;
use crate::db::Database;
use crate::dedup::DedupeCache;
use crate::ledger::Broadcaster;
use crate::resolver::BindingResolver;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub connections: Arc<ConnectionManager>,
    pub resolver: Arc<BindingResolver>,
    pub conversation: ConversationService,
    pub broadcaster: Arc<Broadcaster>,
    pub dedup: Arc<DedupeCache>,
    pub arbiter: Arc<Arbiter>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    pub fn new(db: Database, config: GatewayConfig) -> Self {
        let connections = Arc::new(ConnectionManager::new(config.response_channel_capacity));
        let broadcaster = Broadcaster::new(config.broadcaster_capacity);
        let resolver = Arc::new(BindingResolver::new(db.clone()));
        let conversation = ConversationService::new(db.clone(), broadcaster.clone(), connections.clone());
        let dedup = DedupeCache::new(config.dedup_capacity, config.dedup_ttl);
        let arbiter = Arc::new(Arbiter::new(ArbiterConfig {
            pack_tool_default_timeout: config.pack_tool_default_timeout,
            pack_tool_max_timeout: config.pack_tool_max_timeout,
            question_default_timeout: config.user_question_default_timeout,
            question_min_timeout: config.user_question_min_timeout,
            question_max_timeout: config.user_question_max_timeout,
        }));

        Self {
            db,
            connections,
            resolver,
            conversation,
            broadcaster,
            dedup,
            arbiter,
            config: Arc::new(config),
        }
    }
}
