//! SQLite-backed persistence for relay sessions and time-bounded data.
//!
//! Relay session records outlive the process so a new instance can adopt
//! sessions a crashed owner left behind. Everything else here is bounded by
//! a time-to-live and trimmed by the periodic cleanup pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tabrelay_core_types::{SessionId, SessionState, TabId};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable record of one relay session, keyed by the external session id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelaySessionRecord {
    pub session_id: SessionId,
    pub label: String,
    pub target_path: String,
    pub owner_pid: u32,
    pub created_at_ms: i64,
    pub last_activity_ms: i64,
    pub state: SessionState,
}

#[derive(Clone)]
pub struct RelayStore {
    inner: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl RelayStore {
    /// Open (or create) the relay database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Storage(format!("failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory database, used by tests and `--ephemeral` runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                label TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
            CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS context_snapshots (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                title TEXT,
                content TEXT NOT NULL,
                tab_id INTEGER,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_ts ON context_snapshots(timestamp);

            CREATE TABLE IF NOT EXISTS relay_sessions (
                session_id TEXT PRIMARY KEY,
                label TEXT NOT NULL DEFAULT '',
                target_path TEXT NOT NULL,
                owner_pid INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_activity INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'active'
            );
            CREATE INDEX IF NOT EXISTS idx_relay_target ON relay_sessions(target_path);
            CREATE INDEX IF NOT EXISTS idx_relay_state ON relay_sessions(state);
            ",
        )?;
        Ok(())
    }

    /// Insert or overwrite the durable record for a session.
    pub fn upsert_relay_session(&self, record: &RelaySessionRecord) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO relay_sessions
                 (session_id, label, target_path, owner_pid, created_at, last_activity, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(session_id) DO UPDATE SET
                 label = excluded.label,
                 target_path = excluded.target_path,
                 owner_pid = excluded.owner_pid,
                 last_activity = excluded.last_activity,
                 state = excluded.state",
            params![
                record.session_id.as_str(),
                record.label,
                record.target_path,
                record.owner_pid,
                record.created_at_ms,
                record.last_activity_ms,
                record.state.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_relay_session(&self, session_id: &SessionId) -> Result<Option<RelaySessionRecord>> {
        let conn = self.inner.lock();
        conn.query_row(
            "SELECT session_id, label, target_path, owner_pid, created_at, last_activity, state
             FROM relay_sessions WHERE session_id = ?1",
            params![session_id.as_str()],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn touch_activity(&self, session_id: &SessionId, now_ms: i64) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "UPDATE relay_sessions SET last_activity = ?2 WHERE session_id = ?1",
            params![session_id.as_str(), now_ms],
        )?;
        Ok(())
    }

    /// Mark every record owned by `pid` as orphaned. Called by a new process
    /// instance when it finds records from a previous run.
    pub fn orphan_owned_by(&self, pid: u32) -> Result<usize> {
        let conn = self.inner.lock();
        let changed = conn.execute(
            "UPDATE relay_sessions SET state = 'orphaned' WHERE owner_pid = ?1 AND state = 'active'",
            params![pid],
        )?;
        Ok(changed)
    }

    pub fn mark_orphaned(&self, session_id: &SessionId) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "UPDATE relay_sessions SET state = 'orphaned' WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        Ok(())
    }

    /// Find an orphaned record pointing at the same logical target so a new
    /// process can resume the session under its original id.
    pub fn find_orphaned_by_target_path(
        &self,
        target_path: &str,
    ) -> Result<Option<RelaySessionRecord>> {
        let conn = self.inner.lock();
        conn.query_row(
            "SELECT session_id, label, target_path, owner_pid, created_at, last_activity, state
             FROM relay_sessions
             WHERE target_path = ?1 AND state = 'orphaned'
             ORDER BY last_activity DESC LIMIT 1",
            params![target_path],
            row_to_record,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Adopt an orphaned record: new owner, state `recovered`, fresh activity.
    pub fn adopt(&self, session_id: &SessionId, new_owner_pid: u32, now_ms: i64) -> Result<bool> {
        let conn = self.inner.lock();
        let changed = conn.execute(
            "UPDATE relay_sessions
             SET state = 'recovered', owner_pid = ?2, last_activity = ?3
             WHERE session_id = ?1 AND state = 'orphaned'",
            params![session_id.as_str(), new_owner_pid, now_ms],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_relay_session(&self, session_id: &SessionId) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "DELETE FROM relay_sessions WHERE session_id = ?1",
            params![session_id.as_str()],
        )?;
        Ok(())
    }

    /// Delete orphaned records inactive beyond `ttl_ms`, plus aged messages
    /// and context snapshots. Returns the number of relay records removed.
    pub fn cleanup_expired(&self, ttl_ms: i64, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms - ttl_ms;
        let conn = self.inner.lock();
        let removed = conn.execute(
            "DELETE FROM relay_sessions WHERE state = 'orphaned' AND last_activity < ?1",
            params![cutoff],
        )?;
        let messages = conn.execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])?;
        let snapshots = conn.execute(
            "DELETE FROM context_snapshots WHERE timestamp < ?1",
            params![cutoff],
        )?;
        if removed + messages + snapshots > 0 {
            debug!(
                relay_sessions = removed,
                messages, snapshots, "expired records removed"
            );
        }
        Ok(removed)
    }

    pub fn list_relay_sessions(&self) -> Result<Vec<RelaySessionRecord>> {
        let conn = self.inner.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, label, target_path, owner_pid, created_at, last_activity, state
             FROM relay_sessions ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Upsert the conversational session row keyed by the same external id.
    pub fn ensure_session(&self, session_id: &SessionId, label: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO sessions (id, label, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET label = excluded.label, updated_at = excluded.updated_at",
            params![session_id.as_str(), label, now],
        )?;
        Ok(())
    }

    pub fn append_message(
        &self,
        session_id: &SessionId,
        role: &str,
        content: &str,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO messages (id, session_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                session_id.as_str(),
                role,
                content,
                now_ms,
            ],
        )?;
        Ok(())
    }

    pub fn record_context_snapshot(
        &self,
        url: &str,
        title: Option<&str>,
        content: &str,
        tab_id: Option<TabId>,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.inner.lock();
        conn.execute(
            "INSERT INTO context_snapshots (id, url, title, content, tab_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                uuid::Uuid::new_v4().to_string(),
                url,
                title,
                content,
                tab_id.map(|t| t.0 as i64),
                now_ms,
            ],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RelaySessionRecord> {
    let state_raw: String = row.get(6)?;
    Ok(RelaySessionRecord {
        session_id: SessionId::new(row.get::<_, String>(0)?),
        label: row.get(1)?,
        target_path: row.get(2)?,
        owner_pid: row.get(3)?,
        created_at_ms: row.get(4)?,
        last_activity_ms: row.get(5)?,
        state: SessionState::parse(&state_raw).unwrap_or(SessionState::Orphaned),
    })
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, pid: u32, activity: i64) -> RelaySessionRecord {
        RelaySessionRecord {
            session_id: SessionId::new(id),
            label: format!("label-{id}"),
            target_path: "/work/project-a".to_string(),
            owner_pid: pid,
            created_at_ms: activity,
            last_activity_ms: activity,
            state: SessionState::Active,
        }
    }

    #[test]
    fn upsert_overwrites_by_session_id() {
        let store = RelayStore::open_in_memory().unwrap();
        store.upsert_relay_session(&record("s1", 100, 1_000)).unwrap();
        let mut updated = record("s1", 200, 2_000);
        updated.label = "renamed".to_string();
        store.upsert_relay_session(&updated).unwrap();

        let got = store
            .get_relay_session(&SessionId::new("s1"))
            .unwrap()
            .unwrap();
        assert_eq!(got.owner_pid, 200);
        assert_eq!(got.label, "renamed");
        assert_eq!(store.list_relay_sessions().unwrap().len(), 1);
    }

    #[test]
    fn orphan_then_adopt_resumes_same_session_id() {
        let store = RelayStore::open_in_memory().unwrap();
        store.upsert_relay_session(&record("s1", 100, 1_000)).unwrap();

        // previous owner died without cleanup
        assert_eq!(store.orphan_owned_by(100).unwrap(), 1);
        let orphan = store
            .find_orphaned_by_target_path("/work/project-a")
            .unwrap()
            .expect("orphan visible by target path");
        assert_eq!(orphan.session_id, SessionId::new("s1"));

        assert!(store.adopt(&orphan.session_id, 300, 5_000).unwrap());
        let got = store.get_relay_session(&orphan.session_id).unwrap().unwrap();
        assert_eq!(got.state, SessionState::Recovered);
        assert_eq!(got.owner_pid, 300);

        // second adoption attempt is a no-op
        assert!(!store.adopt(&orphan.session_id, 301, 6_000).unwrap());
    }

    #[test]
    fn cleanup_removes_expired_orphans_only() {
        let store = RelayStore::open_in_memory().unwrap();
        store.upsert_relay_session(&record("old", 1, 0)).unwrap();
        store.upsert_relay_session(&record("new", 2, 10_000)).unwrap();
        store.orphan_owned_by(1).unwrap();
        store.orphan_owned_by(2).unwrap();

        // ttl 5s at t=11s: only "old" (activity 0) is past the cutoff
        let removed = store.cleanup_expired(5_000, 11_000).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_relay_session(&SessionId::new("old")).unwrap().is_none());
        assert!(store.get_relay_session(&SessionId::new("new")).unwrap().is_some());
    }

    #[test]
    fn cleanup_trims_aged_messages_and_snapshots() {
        let store = RelayStore::open_in_memory().unwrap();
        let sid = SessionId::new("s1");
        store.ensure_session(&sid, "demo").unwrap();
        store.append_message(&sid, "user", "old", 0).unwrap();
        store.append_message(&sid, "user", "new", 10_000).unwrap();
        store
            .record_context_snapshot("https://example.com", Some("t"), "body", Some(TabId(3)), 0)
            .unwrap();

        store.cleanup_expired(5_000, 11_000).unwrap();
        let conn = store.inner.lock();
        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        let snapshots: i64 = conn
            .query_row("SELECT COUNT(*) FROM context_snapshots", [], |r| r.get(0))
            .unwrap();
        assert_eq!(messages, 1);
        assert_eq!(snapshots, 0);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        {
            let store = RelayStore::open(&path).unwrap();
            store.upsert_relay_session(&record("s1", 42, 1_000)).unwrap();
        }
        let store = RelayStore::open(&path).unwrap();
        let got = store.get_relay_session(&SessionId::new("s1")).unwrap();
        assert_eq!(got.unwrap().owner_pid, 42);
    }
}
