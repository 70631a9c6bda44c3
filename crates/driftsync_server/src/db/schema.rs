use rusqlite::Connection;

/// SQL schema for the dual-storage layout: the append-only CRDT event
/// log and the materialized current-state table.
const SCHEMA: &str = r#"
-- Append-only CRDT event log
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    document_id TEXT,
    operation_type TEXT NOT NULL,
    crdt_bytes BLOB NOT NULL,
    version INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL
);

-- Stream queries scan ascending (timestamp, id) per collection
CREATE INDEX IF NOT EXISTS idx_events_collection_timestamp
    ON events(collection, timestamp, id);

-- Re-submitting identical bytes is a no-op
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_collection_hash
    ON events(collection, hash);

-- Materialized current-state table
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    document_id TEXT NOT NULL,
    doc TEXT NOT NULL,
    version INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (collection, document_id)
);
"#;

/// Initialize the database with the replication schema.
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"documents".to_string()));
    }

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }
}
