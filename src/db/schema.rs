//! SQL DDL for the SQLite realization of the persistence collaborator.
//!
//! The concrete schema is an implementation detail behind [`crate::db::Database`];
//! nothing outside this module depends on column layout.

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS principals (
    id              TEXT PRIMARY KEY,
    kind            TEXT NOT NULL,
    fingerprint     TEXT NOT NULL UNIQUE,
    display_name    TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bindings (
    id                  TEXT PRIMARY KEY,
    frontend            TEXT NOT NULL,
    channel_id          TEXT NOT NULL,
    agent_principal_id  TEXT NOT NULL REFERENCES principals(id),
    working_dir         TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    created_by          TEXT,
    UNIQUE(frontend, channel_id)
);

CREATE TABLE IF NOT EXISTS threads (
    id          TEXT PRIMARY KEY,
    frontend    TEXT NOT NULL,
    external_id TEXT NOT NULL,
    agent_id    TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(frontend, external_id)
);

CREATE TABLE IF NOT EXISTS ledger_events (
    id                  TEXT PRIMARY KEY,
    conversation_key    TEXT NOT NULL,
    thread_id           TEXT,
    direction           TEXT NOT NULL,
    author              TEXT NOT NULL,
    timestamp           TEXT NOT NULL,
    kind                TEXT NOT NULL,
    text                TEXT,
    raw_tag             TEXT,
    actor_principal_id  TEXT,
    actor_member_id     TEXT
);

CREATE INDEX IF NOT EXISTS idx_ledger_events_conv_ts
    ON ledger_events(conversation_key, timestamp, id);

CREATE INDEX IF NOT EXISTS idx_ledger_events_thread
    ON ledger_events(thread_id, timestamp, id);
";
