//! Environment-variable configuration, read once at startup.
//!
//! Follows the same pattern as the teacher's `main.rs`: no config-file
//! crate, plain `env::var` reads with defaults, parsed eagerly so a bad
//! value fails fast instead of surfacing later as a confusing runtime error.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub db_path: String,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub response_channel_capacity: usize,
    pub broadcaster_capacity: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub pack_tool_default_timeout: Duration,
    pub pack_tool_max_timeout: Duration,
    pub user_question_default_timeout: Duration,
    pub user_question_min_timeout: Duration,
    pub user_question_max_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("GATEWAY_BIND_ADDR", "0.0.0.0:8088"),
            db_path: env_or("GATEWAY_DB_PATH", "gateway.db"),
            dedup_ttl: Duration::from_secs(env_parse_or("GATEWAY_DEDUP_TTL_SECS", 300)),
            dedup_capacity: env_parse_or("GATEWAY_DEDUP_CAPACITY", 10_000),
            response_channel_capacity: env_parse_or("GATEWAY_RESPONSE_CHANNEL_CAPACITY", 32),
            broadcaster_capacity: env_parse_or("GATEWAY_BROADCAST_CAPACITY", 256),
            heartbeat_interval: Duration::from_secs(env_parse_or("GATEWAY_HEARTBEAT_INTERVAL_SECS", 30)),
            heartbeat_timeout: Duration::from_secs(env_parse_or("GATEWAY_HEARTBEAT_TIMEOUT_SECS", 90)),
            pack_tool_default_timeout: Duration::from_secs(env_parse_or("GATEWAY_PACK_TOOL_DEFAULT_TIMEOUT_SECS", 30)),
            pack_tool_max_timeout: Duration::from_secs(env_parse_or("GATEWAY_PACK_TOOL_MAX_TIMEOUT_SECS", 300)),
            user_question_default_timeout: Duration::from_secs(env_parse_or("GATEWAY_QUESTION_DEFAULT_TIMEOUT_SECS", 60)),
            user_question_min_timeout: Duration::from_secs(env_parse_or("GATEWAY_QUESTION_MIN_TIMEOUT_SECS", 1)),
            user_question_max_timeout: Duration::from_secs(env_parse_or("GATEWAY_QUESTION_MAX_TIMEOUT_SECS", 300)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
