//! Session log persistence
//!
//! Stores conversation sessions and the messages exchanged in them.

mod schema;

pub use schema::*;

use crate::transcript::Sender;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    pub fn insert_session(&self, session: &LoggedSession) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (session_id, start_time, end_time, status) VALUES (?1, ?2, ?3, ?4)",
            params![
                session.session_id,
                session.start_time.to_rfc3339(),
                session.end_time.map(|t| t.to_rfc3339()),
                session.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Mark a session completed. Returns whether a row matched.
    pub fn close_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> DbResult<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sessions SET end_time = ?1, status = 'completed' WHERE session_id = ?2",
            params![ended_at.to_rfc3339(), session_id],
        )?;
        Ok(updated > 0)
    }

    pub fn get_session(&self, session_id: &str) -> DbResult<LoggedSession> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT session_id, start_time, end_time, status FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| {
                Ok(LoggedSession {
                    session_id: row.get(0)?,
                    start_time: parse_datetime(&row.get::<_, String>(1)?),
                    end_time: row.get::<_, Option<String>>(2)?.map(|s| parse_datetime(&s)),
                    status: parse_status(&row.get::<_, String>(3)?),
                })
            },
        )
        .optional()?
        .ok_or_else(|| DbError::SessionNotFound(session_id.to_string()))
    }

    // ==================== Message Operations ====================

    pub fn insert_message(&self, message: &LoggedMessage) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (session_id, sender, message, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![
                message.session_id,
                message.sender.as_str(),
                message.message,
                message.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Check for an exact `(session_id, sender, message)` match.
    /// Used to make appends idempotent.
    pub fn message_exists(&self, session_id: &str, sender: Sender, text: &str) -> DbResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1 AND sender = ?2 AND message = ?3",
            params![session_id, sender.as_str(), text],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Messages of a session in insertion order
    pub fn list_messages(&self, session_id: &str) -> DbResult<Vec<LoggedMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, sender, message, timestamp FROM messages
             WHERE session_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(LoggedMessage {
                session_id: row.get(0)?,
                sender: Sender::parse(&row.get::<_, String>(1)?).unwrap_or(Sender::Avatar),
                message: row.get(2)?,
                timestamp: parse_datetime(&row.get::<_, String>(3)?),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn parse_status(s: &str) -> SessionStatus {
    match s {
        "active" => SessionStatus::Active,
        _ => SessionStatus::Completed,
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
