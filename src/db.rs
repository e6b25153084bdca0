//! SQLite-backed realization of the persistence collaborator.
//!
//! Mirrors the teacher's storage idiom: one `Arc<Mutex<Connection>>` handle,
//! RFC-3339 text timestamps, migrations run once at open via `execute_batch`.

mod schema;

pub use schema::SCHEMA;

use crate::model::{
    Binding, EventDirection, EventKind, EventPage, LedgerEvent, Principal, PrincipalKind,
    PrincipalStatus, Thread,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("principal not found: {0}")]
    PrincipalNotFound(String),
    #[error("binding not found: {0}")]
    BindingNotFound(String),
    #[error("thread not found: {0}")]
    ThreadNotFound(String),
    #[error("duplicate pubkey: {0}")]
    DuplicatePubkey(String),
    #[error("duplicate channel: {0}/{1}")]
    DuplicateChannel(String, String),
    #[error("duplicate event: {0}")]
    DuplicateEvent(String),
}

pub type DbResult<T> = Result<T, DbError>;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Principals ====================

    pub fn create_principal(
        &self,
        id: &str,
        kind: PrincipalKind,
        fingerprint: &str,
        display_name: &str,
        status: PrincipalStatus,
    ) -> DbResult<Principal> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM principals WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(DbError::DuplicatePubkey(fingerprint.to_string()));
        }
        conn.execute(
            "INSERT INTO principals (id, kind, fingerprint, display_name, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                kind.to_string(),
                fingerprint,
                display_name,
                status.to_string(),
                now.to_rfc3339()
            ],
        )?;
        Ok(Principal {
            id: id.to_string(),
            kind,
            fingerprint: fingerprint.to_string(),
            display_name: display_name.to_string(),
            status,
            created_at: now,
        })
    }

    pub fn get_principal(&self, id: &str) -> DbResult<Principal> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, kind, fingerprint, display_name, status, created_at FROM principals WHERE id = ?1",
            params![id],
            parse_principal_row,
        )
        .map_err(|e| map_not_found(e, || DbError::PrincipalNotFound(id.to_string())))
    }

    pub fn get_principal_by_fingerprint(&self, fingerprint: &str) -> DbResult<Principal> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, kind, fingerprint, display_name, status, created_at FROM principals WHERE fingerprint = ?1",
            params![fingerprint],
            parse_principal_row,
        )
        .map_err(|e| map_not_found(e, || DbError::PrincipalNotFound(fingerprint.to_string())))
    }

    pub fn set_principal_status(&self, id: &str, status: PrincipalStatus) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE principals SET status = ?1 WHERE id = ?2",
            params![status.to_string(), id],
        )?;
        if updated == 0 {
            return Err(DbError::PrincipalNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn list_principals(&self) -> DbResult<Vec<Principal>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, fingerprint, display_name, status, created_at FROM principals ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_principal_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Bindings ====================

    pub fn create_binding(
        &self,
        id: &str,
        frontend: &str,
        channel_id: &str,
        agent_principal_id: &str,
        working_dir: &str,
        created_by: Option<&str>,
    ) -> DbResult<Binding> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM bindings WHERE frontend = ?1 AND channel_id = ?2",
                params![frontend, channel_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(DbError::DuplicateChannel(
                frontend.to_string(),
                channel_id.to_string(),
            ));
        }
        conn.execute(
            "INSERT INTO bindings (id, frontend, channel_id, agent_principal_id, working_dir, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, frontend, channel_id, agent_principal_id, working_dir, now.to_rfc3339(), created_by],
        )?;
        Ok(Binding {
            id: id.to_string(),
            frontend: frontend.to_string(),
            channel_id: channel_id.to_string(),
            agent_principal_id: agent_principal_id.to_string(),
            working_dir: working_dir.to_string(),
            created_at: now,
            created_by: created_by.map(String::from),
        })
    }

    /// Rebind `(frontend, channel_id)` to a new agent/working dir. Returns the
    /// previous `agent_principal_id` if one existed (used by the REST layer
    /// to report `rebound_from`).
    pub fn upsert_binding(
        &self,
        id: &str,
        frontend: &str,
        channel_id: &str,
        agent_principal_id: &str,
        working_dir: &str,
        created_by: Option<&str>,
    ) -> DbResult<(Binding, Option<String>)> {
        let existing = self.get_binding_by_channel(frontend, channel_id).ok();
        if let Some(existing) = existing {
            if existing.agent_principal_id == agent_principal_id
                && existing.working_dir == working_dir
            {
                return Ok((existing, None));
            }
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE bindings SET agent_principal_id = ?1, working_dir = ?2 WHERE id = ?3",
                params![agent_principal_id, working_dir, existing.id],
            )?;
            let rebound_from = existing.agent_principal_id.clone();
            return Ok((
                Binding {
                    agent_principal_id: agent_principal_id.to_string(),
                    working_dir: working_dir.to_string(),
                    ..existing
                },
                Some(rebound_from),
            ));
        }
        let created = self.create_binding(
            id,
            frontend,
            channel_id,
            agent_principal_id,
            working_dir,
            created_by,
        )?;
        Ok((created, None))
    }

    pub fn get_binding_by_channel(&self, frontend: &str, channel_id: &str) -> DbResult<Binding> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, frontend, channel_id, agent_principal_id, working_dir, created_at, created_by
             FROM bindings WHERE frontend = ?1 AND channel_id = ?2",
            params![frontend, channel_id],
            parse_binding_row,
        )
        .map_err(|e| map_not_found(e, || DbError::BindingNotFound(format!("{frontend}/{channel_id}"))))
    }

    pub fn delete_binding(&self, frontend: &str, channel_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM bindings WHERE frontend = ?1 AND channel_id = ?2",
            params![frontend, channel_id],
        )?;
        if deleted == 0 {
            return Err(DbError::BindingNotFound(format!("{frontend}/{channel_id}")));
        }
        Ok(())
    }

    pub fn list_bindings(&self) -> DbResult<Vec<Binding>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, frontend, channel_id, agent_principal_id, working_dir, created_at, created_by
             FROM bindings ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], parse_binding_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // ==================== Threads ====================

    pub fn get_or_create_thread(
        &self,
        frontend: &str,
        external_id: &str,
        agent_id: &str,
        new_id: &str,
    ) -> DbResult<Thread> {
        if let Ok(existing) = self.get_thread_by_external(frontend, external_id) {
            return Ok(existing);
        }
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO threads (id, frontend, external_id, agent_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![new_id, frontend, external_id, agent_id, now.to_rfc3339()],
        )?;
        Ok(Thread {
            id: new_id.to_string(),
            frontend: frontend.to_string(),
            external_id: external_id.to_string(),
            agent_id: agent_id.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_thread(&self, id: &str) -> DbResult<Thread> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, frontend, external_id, agent_id, created_at, updated_at FROM threads WHERE id = ?1",
            params![id],
            parse_thread_row,
        )
        .map_err(|e| map_not_found(e, || DbError::ThreadNotFound(id.to_string())))
    }

    pub fn get_thread_by_external(&self, frontend: &str, external_id: &str) -> DbResult<Thread> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, frontend, external_id, agent_id, created_at, updated_at
             FROM threads WHERE frontend = ?1 AND external_id = ?2",
            params![frontend, external_id],
            parse_thread_row,
        )
        .map_err(|e| map_not_found(e, || DbError::ThreadNotFound(external_id.to_string())))
    }

    // ==================== Ledger events ====================

    pub fn save_event(&self, event: &LedgerEvent) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM ledger_events WHERE id = ?1",
                params![event.id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(DbError::DuplicateEvent(event.id.clone()));
        }
        conn.execute(
            "INSERT INTO ledger_events
             (id, conversation_key, thread_id, direction, author, timestamp, kind, text, raw_tag, actor_principal_id, actor_member_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                event.id,
                event.conversation_key,
                event.thread_id,
                event.direction.to_string(),
                event.author,
                event.timestamp.to_rfc3339(),
                event.kind.to_string(),
                event.text,
                event.raw_tag,
                event.actor_principal_id,
                event.actor_member_id,
            ],
        )?;
        Ok(())
    }

    /// Paginated forward read ordered by `(timestamp, id)`.
    pub fn get_events(
        &self,
        conversation_key: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
        cursor: Option<&str>,
    ) -> DbResult<EventPage> {
        let (cursor_ts, cursor_id) = cursor.map(decode_cursor).transpose()?.unwrap_or_default();
        let since_ts = since.map(|d| d.to_rfc3339()).unwrap_or_default();
        let effective_ts = if cursor_ts > since_ts { cursor_ts.clone() } else { since_ts };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_key, thread_id, direction, author, timestamp, kind, text, raw_tag, actor_principal_id, actor_member_id
             FROM ledger_events
             WHERE conversation_key = ?1 AND (timestamp > ?2 OR (timestamp = ?2 AND id > ?3))
             ORDER BY timestamp ASC, id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![conversation_key, effective_ts, cursor_id, (limit as i64) + 1],
            parse_event_row,
        )?;
        let mut events = rows.collect::<Result<Vec<_>, _>>()?;
        let has_more = events.len() > limit;
        events.truncate(limit);
        let next_cursor = events
            .last()
            .map(|e| encode_cursor(&e.timestamp.to_rfc3339(), &e.id));
        Ok(EventPage {
            events,
            has_more,
            next_cursor,
        })
    }

    pub fn get_events_by_thread(&self, thread_id: &str, limit: usize) -> DbResult<Vec<LedgerEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_key, thread_id, direction, author, timestamp, kind, text, raw_tag, actor_principal_id, actor_member_id
             FROM ledger_events WHERE thread_id = ?1 ORDER BY timestamp ASC, id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit as i64], parse_event_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn encode_cursor(ts: &str, id: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{ts}|{id}"))
}

fn decode_cursor(raw: &str) -> DbResult<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(|_| DbError::Sqlite(rusqlite::Error::InvalidQuery))?;
    let text = String::from_utf8(decoded).map_err(|_| DbError::Sqlite(rusqlite::Error::InvalidQuery))?;
    let (ts, id) = text
        .split_once('|')
        .ok_or(DbError::Sqlite(rusqlite::Error::InvalidQuery))?;
    Ok((ts.to_string(), id.to_string()))
}

fn map_not_found(e: rusqlite::Error, on_missing: impl FnOnce() -> DbError) -> DbError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => on_missing(),
        other => DbError::Sqlite(other),
    }
}

fn parse_principal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Principal> {
    let kind: String = row.get(1)?;
    let status: String = row.get(4)?;
    Ok(Principal {
        id: row.get(0)?,
        kind: kind.parse().unwrap_or(PrincipalKind::Client),
        fingerprint: row.get(2)?,
        display_name: row.get(3)?,
        status: status.parse().unwrap_or(PrincipalStatus::Pending),
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_binding_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Binding> {
    Ok(Binding {
        id: row.get(0)?,
        frontend: row.get(1)?,
        channel_id: row.get(2)?,
        agent_principal_id: row.get(3)?,
        working_dir: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        created_by: row.get(6)?,
    })
}

fn parse_thread_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
    Ok(Thread {
        id: row.get(0)?,
        frontend: row.get(1)?,
        external_id: row.get(2)?,
        agent_id: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let direction: String = row.get(3)?;
    let kind: String = row.get(6)?;
    Ok(LedgerEvent {
        id: row.get(0)?,
        conversation_key: row.get(1)?,
        thread_id: row.get(2)?,
        direction: direction.parse().unwrap_or(EventDirection::Inbound),
        author: row.get(4)?,
        timestamp: parse_datetime(&row.get::<_, String>(5)?),
        kind: kind.parse().unwrap_or(EventKind::System),
        text: row.get(7)?,
        raw_tag: row.get(8)?,
        actor_principal_id: row.get(9)?,
        actor_member_id: row.get(10)?,
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn create_and_get_principal() {
        let db = db();
        let p = db
            .create_principal("p1", PrincipalKind::Agent, "a".repeat(64).as_str(), "Agent One", PrincipalStatus::Approved)
            .unwrap();
        let fetched = db.get_principal(&p.id).unwrap();
        assert_eq!(fetched.fingerprint, "a".repeat(64));
    }

    #[test]
    fn duplicate_fingerprint_rejected() {
        let db = db();
        db.create_principal("p1", PrincipalKind::Agent, "fp1", "One", PrincipalStatus::Approved)
            .unwrap();
        let err = db
            .create_principal("p2", PrincipalKind::Agent, "fp1", "Two", PrincipalStatus::Approved)
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicatePubkey(_)));
    }

    #[test]
    fn binding_uniqueness_and_rebind() {
        let db = db();
        db.create_principal("p1", PrincipalKind::Agent, "fp1", "One", PrincipalStatus::Approved)
            .unwrap();
        db.create_principal("p2", PrincipalKind::Agent, "fp2", "Two", PrincipalStatus::Approved)
            .unwrap();
        db.create_binding("b1", "matrix", "!room", "p1", "/w", None).unwrap();
        let err = db
            .create_binding("b2", "matrix", "!room", "p2", "/w2", None)
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateChannel(_, _)));

        let (binding, rebound_from) = db
            .upsert_binding("b3", "matrix", "!room", "p2", "/w2", None)
            .unwrap();
        assert_eq!(binding.agent_principal_id, "p2");
        assert_eq!(rebound_from, Some("p1".to_string()));
    }

    #[test]
    fn thread_stability() {
        let db = db();
        let t1 = db.get_or_create_thread("slack", "C1", "agent-a", "new-id").unwrap();
        let t2 = db.get_or_create_thread("slack", "C1", "agent-a", "ignored-id").unwrap();
        assert_eq!(t1.id, t2.id);
    }

    #[test]
    fn ledger_duplicate_rejected_and_ordered() {
        let db = db();
        let now = Utc::now();
        let ev1 = LedgerEvent {
            id: "e1".into(),
            conversation_key: "agent-a".into(),
            thread_id: None,
            direction: EventDirection::Inbound,
            author: "user".into(),
            timestamp: now,
            kind: EventKind::Message,
            text: Some("hi".into()),
            raw_tag: None,
            actor_principal_id: None,
            actor_member_id: None,
        };
        db.save_event(&ev1).unwrap();
        let err = db.save_event(&ev1).unwrap_err();
        assert!(matches!(err, DbError::DuplicateEvent(_)));

        let ev2 = LedgerEvent {
            id: "e2".into(),
            timestamp: now + chrono::Duration::seconds(1),
            text: Some("hello back".into()),
            direction: EventDirection::Outbound,
            ..ev1.clone()
        };
        db.save_event(&ev2).unwrap();

        let page = db.get_events("agent-a", None, 10, None).unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[0].id, "e1");
        assert_eq!(page.events[1].id, "e2");
        assert!(!page.has_more);
    }

    #[test]
    fn ledger_pagination_cursor() {
        let db = db();
        let now = Utc::now();
        for i in 0..5 {
            db.save_event(&LedgerEvent {
                id: format!("e{i}"),
                conversation_key: "agent-a".into(),
                thread_id: None,
                direction: EventDirection::Inbound,
                author: "user".into(),
                timestamp: now + chrono::Duration::seconds(i),
                kind: EventKind::Message,
                text: Some(format!("msg{i}")),
                raw_tag: None,
                actor_principal_id: None,
                actor_member_id: None,
            })
            .unwrap();
        }
        let page1 = db.get_events("agent-a", None, 2, None).unwrap();
        assert_eq!(page1.events.len(), 2);
        assert!(page1.has_more);
        let page2 = db
            .get_events("agent-a", None, 2, page1.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page2.events[0].id, "e2");
    }
}
