//! SQLite-backed store.
//!
//! ## Tables
//!
//! - `allowed_groups` - groups the bot moderates
//! - `group_topics` - challenge topic per group
//! - `pending_users` - one row per outstanding challenge (`user_id` is the
//!   primary key, which is what rejects a second concurrent challenge)
//! - `join_attempts` - append-only, drives the retry cooldown
//! - `verification_history` - append-only audit log
//!
//! rusqlite is synchronous; every call runs on the blocking pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bouncer_common::{
    AllowedGroup, ChatId, JoinAttempt, PendingChallenge, UserId, Verdict, VerificationRecord,
    VerificationStats,
};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use tracing::{debug, info};

use super::{StorageError, Store};

/// Current schema version
const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS allowed_groups (
    chat_id     INTEGER PRIMARY KEY,
    chat_title  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS group_topics (
    chat_id     INTEGER PRIMARY KEY,
    topic       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_users (
    user_id       INTEGER PRIMARY KEY,
    chat_id       INTEGER NOT NULL,
    chat_title    TEXT NOT NULL,
    full_name     TEXT NOT NULL,
    issued_at_ms  INTEGER NOT NULL,
    challenge     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS join_attempts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    user_id     INTEGER NOT NULL,
    full_name   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_join_attempts_user
    ON join_attempts(user_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS verification_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   INTEGER NOT NULL,
    chat_id     INTEGER NOT NULL,
    chat_title  TEXT NOT NULL,
    user_id     INTEGER NOT NULL,
    full_name   TEXT NOT NULL,
    challenge   TEXT NOT NULL,
    answer      TEXT NOT NULL,
    verdict     TEXT NOT NULL,
    reason      TEXT NOT NULL
);
"#;

/// SQLite [`Store`]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init(conn)
    }

    /// Open an in-memory database
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    async fn run<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StorageError::Task(format!("Lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let current: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    match current {
        Some(v) if v >= SCHEMA_VERSION => {
            debug!("Database schema is up to date (v{})", v);
        }
        _ => {
            info!("Creating database schema v{}", SCHEMA_VERSION);
            conn.execute_batch(SCHEMA)?;
            conn.execute("DELETE FROM schema_version", [])?;
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
    }

    Ok(())
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingChallenge> {
    Ok(PendingChallenge {
        user_id: UserId(row.get(0)?),
        chat_id: ChatId(row.get(1)?),
        chat_title: row.get(2)?,
        display_name: row.get(3)?,
        issued_at_ms: row.get(4)?,
        challenge: row.get(5)?,
    })
}

const PENDING_COLUMNS: &str = "user_id, chat_id, chat_title, full_name, issued_at_ms, challenge";

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<(), StorageError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn is_group_allowed(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        self.run(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM allowed_groups WHERE chat_id = ?1",
                    [chat_id.0],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn allow_group(&self, group: &AllowedGroup) -> Result<(), StorageError> {
        let group = group.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO allowed_groups (chat_id, chat_title) VALUES (?1, ?2)
                 ON CONFLICT(chat_id) DO UPDATE SET chat_title = excluded.chat_title",
                params![group.chat_id.0, group.display_name],
            )?;
            Ok(())
        })
        .await
    }

    async fn revoke_group(&self, chat_id: ChatId) -> Result<bool, StorageError> {
        self.run(move |conn| {
            let removed =
                conn.execute("DELETE FROM allowed_groups WHERE chat_id = ?1", [chat_id.0])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_allowed_groups(&self) -> Result<Vec<AllowedGroup>, StorageError> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT chat_id, chat_title FROM allowed_groups ORDER BY chat_id")?;
            let groups = stmt
                .query_map([], |row| {
                    Ok(AllowedGroup {
                        chat_id: ChatId(row.get(0)?),
                        display_name: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(groups)
        })
        .await
    }

    async fn get_group_topic(&self, chat_id: ChatId) -> Result<Option<String>, StorageError> {
        self.run(move |conn| {
            let topic = conn
                .query_row(
                    "SELECT topic FROM group_topics WHERE chat_id = ?1",
                    [chat_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(topic)
        })
        .await
    }

    async fn set_group_topic(&self, chat_id: ChatId, topic: &str) -> Result<(), StorageError> {
        let topic = topic.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO group_topics (chat_id, topic) VALUES (?1, ?2)
                 ON CONFLICT(chat_id) DO UPDATE SET topic = excluded.topic",
                params![chat_id.0, topic],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_pending(&self, pending: &PendingChallenge) -> Result<(), StorageError> {
        let p = pending.clone();
        self.run(move |conn| {
            let result = conn.execute(
                "INSERT INTO pending_users
                    (user_id, chat_id, chat_title, full_name, issued_at_ms, challenge)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    p.user_id.0,
                    p.chat_id.0,
                    p.chat_title,
                    p.display_name,
                    p.issued_at_ms,
                    p.challenge
                ],
            );

            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StorageError::DuplicatePending(p.user_id))
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_pending(&self, user_id: UserId) -> Result<Option<PendingChallenge>, StorageError> {
        self.run(move |conn| {
            let pending = conn
                .query_row(
                    &format!("SELECT {PENDING_COLUMNS} FROM pending_users WHERE user_id = ?1"),
                    [user_id.0],
                    pending_from_row,
                )
                .optional()?;
            Ok(pending)
        })
        .await
    }

    async fn remove_pending(
        &self,
        user_id: UserId,
        issued_at_ms: i64,
    ) -> Result<bool, StorageError> {
        self.run(move |conn| {
            let removed = conn.execute(
                "DELETE FROM pending_users WHERE user_id = ?1 AND issued_at_ms = ?2",
                params![user_id.0, issued_at_ms],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<PendingChallenge>, StorageError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {PENDING_COLUMNS} FROM pending_users ORDER BY issued_at_ms"
            ))?;
            let pending = stmt
                .query_map([], pending_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pending)
        })
        .await
    }

    async fn record_join_attempt(&self, attempt: &JoinAttempt) -> Result<(), StorageError> {
        let attempt = attempt.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO join_attempts (timestamp, user_id, full_name) VALUES (?1, ?2, ?3)",
                params![attempt.timestamp, attempt.user_id.0, attempt.display_name],
            )?;
            Ok(())
        })
        .await
    }

    async fn last_join_attempt(&self, user_id: UserId) -> Result<Option<i64>, StorageError> {
        self.run(move |conn| {
            let ts: Option<i64> = conn.query_row(
                "SELECT MAX(timestamp) FROM join_attempts WHERE user_id = ?1",
                [user_id.0],
                |row| row.get(0),
            )?;
            Ok(ts)
        })
        .await
    }

    async fn record_verification(&self, record: &VerificationRecord) -> Result<(), StorageError> {
        let r = record.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO verification_history
                    (timestamp, chat_id, chat_title, user_id, full_name,
                     challenge, answer, verdict, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    r.timestamp,
                    r.chat_id.0,
                    r.chat_title,
                    r.user_id.0,
                    r.display_name,
                    r.challenge,
                    r.answer,
                    r.verdict.as_str(),
                    r.reason
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent_verifications(
        &self,
        limit: usize,
    ) -> Result<Vec<VerificationRecord>, StorageError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, chat_id, chat_title, user_id, full_name,
                        challenge, answer, verdict, reason
                 FROM verification_history ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    let verdict: String = row.get(7)?;
                    Ok((
                        VerificationRecord {
                            timestamp: row.get(0)?,
                            chat_id: ChatId(row.get(1)?),
                            chat_title: row.get(2)?,
                            user_id: UserId(row.get(3)?),
                            display_name: row.get(4)?,
                            challenge: row.get(5)?,
                            answer: row.get(6)?,
                            verdict: Verdict::Declined,
                            reason: row.get(8)?,
                        },
                        verdict,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(mut record, verdict)| -> Result<VerificationRecord, StorageError> {
                    record.verdict = verdict.parse().map_err(StorageError::Corrupt)?;
                    Ok(record)
                })
                .collect()
        })
        .await
    }

    async fn verification_stats(&self) -> Result<VerificationStats, StorageError> {
        self.run(|conn| {
            let pending: i64 =
                conn.query_row("SELECT COUNT(*) FROM pending_users", [], |row| row.get(0))?;
            let (accepted, declined): (i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(verdict = 'accepted'), 0),
                    COALESCE(SUM(verdict = 'declined'), 0)
                 FROM verification_history",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(VerificationStats {
                pending: pending as u64,
                accepted: accepted as u64,
                declined: declined as u64,
            })
        })
        .await
    }
}
