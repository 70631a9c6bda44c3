//! SQLite-backed storage implementation for client persistence.
//!
//! Persists CRDT document snapshots, the incremental update log, and the
//! sync metadata keyspace to a single SQLite database.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use super::{LocalStore, StorageResult};
use crate::crdt::codec;
use crate::crdt::types::{Origin, StoredUpdate};
use crate::error::ReplicateError;

/// SQLite-backed client storage.
///
/// # Thread safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the store is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Document snapshots (compacted state)
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                state_vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Incremental updates appended since the snapshot
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                data BLOB NOT NULL,
                origin TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_updates_collection_id ON updates(collection, id);

            -- Sync metadata (checkpoints, client identity, protocol version)
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Derive the state vector column from snapshot bytes.
    fn state_vector_of(state: &[u8]) -> Vec<u8> {
        let doc = codec::new_doc("state-vector", 0);
        if let Err(e) = codec::restore_snapshot(&doc, state) {
            log::warn!("Failed to derive state vector from snapshot: {}", e);
        }
        codec::state_vector(&doc)
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl LocalStore for SqliteStore {
    fn load_doc(&self, collection: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let result = conn.query_row(
            "SELECT state FROM documents WHERE collection = ?",
            params![collection],
            |row| row.get(0),
        );

        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(ReplicateError::Database(e)),
        }
    }

    fn save_doc(&self, collection: &str, state: &[u8]) -> StorageResult<()> {
        let state_vector = Self::state_vector_of(state);
        let now = chrono::Utc::now().timestamp_millis();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO documents (collection, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![collection, state, state_vector, now],
        )?;
        Ok(())
    }

    fn append_update(&self, collection: &str, update: &[u8], origin: Origin) -> StorageResult<i64> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute(
            "INSERT INTO updates (collection, data, origin, timestamp) VALUES (?, ?, ?, ?)",
            params![collection, update, origin.to_string(), now],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn updates(&self, collection: &str) -> StorageResult<Vec<StoredUpdate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, data, origin, timestamp FROM updates
             WHERE collection = ?
             ORDER BY id ASC",
        )?;

        let updates = stmt
            .query_map(params![collection], |row| {
                let origin_str: String = row.get(2)?;
                Ok(StoredUpdate {
                    update_id: row.get(0)?,
                    collection: collection.to_string(),
                    data: row.get(1)?,
                    timestamp: row.get(3)?,
                    origin: origin_str.parse().unwrap_or(Origin::Subscription),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(updates)
    }

    fn compact(&self, collection: &str, keep_updates: usize) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let update_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE collection = ?",
            params![collection],
            |row| row.get(0),
        )?;
        if update_count as usize <= keep_updates {
            return Ok(());
        }

        let cutoff_id: i64 = conn
            .query_row(
                "SELECT id FROM updates WHERE collection = ? ORDER BY id DESC LIMIT 1 OFFSET ?",
                params![collection, keep_updates.saturating_sub(1)],
                |row| row.get(0),
            )
            .unwrap_or(0);

        let base: Option<Vec<u8>> = conn
            .query_row(
                "SELECT state FROM documents WHERE collection = ?",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;

        let old_updates: Vec<Vec<u8>> = {
            let mut stmt = conn.prepare(
                "SELECT data FROM updates WHERE collection = ? AND id < ? ORDER BY id ASC",
            )?;
            stmt.query_map(params![collection, cutoff_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect()
        };

        let mut parts = Vec::with_capacity(old_updates.len() + 1);
        parts.extend(base);
        parts.extend(old_updates);
        if parts.is_empty() {
            return Ok(());
        }

        let merged = codec::merge_updates(&parts)?;
        let state_vector = Self::state_vector_of(&merged);
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction()?;

        // Save the new snapshot first, then delete the folded updates, so an
        // interrupted compaction can never lose state.
        tx.execute(
            "INSERT OR REPLACE INTO documents (collection, state, state_vector, updated_at)
             VALUES (?, ?, ?, ?)",
            params![collection, merged, state_vector, now],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE collection = ? AND id < ?",
            params![collection, cutoff_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn delete_collection(&self, collection: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM updates WHERE collection = ?", params![collection])?;
        conn.execute(
            "DELETE FROM documents WHERE collection = ?",
            params![collection],
        )?;
        Ok(())
    }

    fn list_collections(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT collection FROM documents ORDER BY collection")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(names)
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(ReplicateError::Database)
    }

    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM meta WHERE key = ?", params![key])?;
        Ok(())
    }
}
