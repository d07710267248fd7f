use crate::error::{Result, StashError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DB_FILE: &str = "meta.db";

/// Page size used by [`KeyIndex::keys_by_chunks`]. Rebalance walks the
/// index one page at a time; a short page signals the last one.
pub const CHUNK_SIZE: usize = 100;

/// Persistent key -> content-hash multi-map backed by a single sqlite
/// file under the store's base directory.
///
/// `hash` is globally unique; a key maps to the hashes in the order they
/// were first inserted.
pub struct KeyIndex {
    db_path: PathBuf,
}

impl KeyIndex {
    pub fn open(base_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(base_dir)?;
        let index = Self {
            db_path: base_dir.join(DB_FILE),
        };
        index.init_schema()?;
        Ok(index)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                hash TEXT NOT NULL UNIQUE
            )",
            [],
        )?;
        Ok(())
    }

    /// Insert one row per hash, all in a single statement.
    ///
    /// Rejects empty keys, empty hash lists and empty hashes. A hash that
    /// is already present (under any key) surfaces as `AlreadyExists`.
    pub fn add(&self, key: &str, hashes: &[String]) -> Result<()> {
        if key.is_empty() {
            return Err(StashError::InvalidRequest("empty key".to_string()));
        }
        if hashes.is_empty() {
            return Err(StashError::InvalidRequest("empty hash list".to_string()));
        }

        let mut sql = String::from("INSERT INTO keys (key, hash) VALUES ");
        let mut values: Vec<&str> = Vec::with_capacity(hashes.len() * 2);
        for (i, hash) in hashes.iter().enumerate() {
            if hash.is_empty() {
                return Err(StashError::InvalidRequest("empty hash".to_string()));
            }
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str("(?, ?)");
            values.push(key);
            values.push(hash);
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values.iter()))
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StashError::AlreadyExists(format!(
                        "a hash in the batch for key '{}' is already indexed",
                        key
                    ))
                } else {
                    StashError::Database(error)
                }
            })?;

        Ok(())
    }

    /// Hashes recorded for `key`, in insertion order.
    pub fn get_by_key(&self, key: &str) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT hash FROM keys WHERE key = ?1 ORDER BY id ASC")?;
        let mut rows = stmt.query(params![key])?;

        let mut hashes = Vec::new();
        while let Some(row) = rows.next()? {
            hashes.push(row.get(0)?);
        }
        Ok(hashes)
    }

    /// Up to [`CHUNK_SIZE`] distinct keys ordered by first-seen row id,
    /// starting at `offset`.
    pub fn keys_by_chunks(&self, offset: usize) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM keys GROUP BY key ORDER BY MIN(id) ASC LIMIT ?1 OFFSET ?2",
        )?;
        let mut rows = stmt.query(params![CHUNK_SIZE as i64, offset as i64])?;

        let mut keys = Vec::new();
        while let Some(row) = rows.next()? {
            keys.push(row.get(0)?);
        }
        Ok(keys)
    }

    /// The key a hash is recorded under, if any.
    pub fn key_for_hash(&self, hash: &str) -> Result<Option<String>> {
        let conn = self.get_conn()?;
        let key = conn
            .query_row(
                "SELECT key FROM keys WHERE hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    /// Delete every row for `key`. Removing an absent key is not an
    /// error.
    pub fn remove_by_key(&self, key: &str) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM keys WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
