//! SQLite-backed string key/value storage.
//!
//! Memos and the dedup cache are both persisted as JSON strings under a
//! single key each, so one table is all the service needs.

use rusqlite::Result as SqliteResult;
use std::sync::{Mutex, MutexGuard};

/// Durable string key/value persistence
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn remove(&self, key: &str) -> Result<(), String>;
}

pub struct Db {
    conn: Mutex<rusqlite::Connection>,
}

impl Db {
    pub fn open(path: &str) -> SqliteResult<Self> {
        let conn = if path == ":memory:" {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        // A panic while holding the lock cannot leave a half-applied statement
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create_tables(&self) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.conn();
        let result = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            [key],
            |row| row.get(0),
        );
        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn set_value(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Returns true if a row was deleted
    pub fn remove_value(&self, key: &str) -> SqliteResult<bool> {
        let conn = self.conn();
        let deleted = conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }
}

impl KeyValueStorage for Db {
    fn get(&self, key: &str) -> Result<Option<String>, String> {
        self.get_value(key)
            .map_err(|e| format!("Failed to read '{}': {}", key, e))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.set_value(key, value)
            .map_err(|e| format!("Failed to write '{}': {}", key, e))
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        self.remove_value(key)
            .map(|_| ())
            .map_err(|e| format!("Failed to remove '{}': {}", key, e))
    }
}
