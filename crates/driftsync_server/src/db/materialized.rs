//! Materialized current-state table.
//!
//! One row per live document, written as the second leg of each
//! dual-storage mutation. Deletes remove the row physically; the
//! deletion delta stays behind in the event log.

use driftsync_core::MaterializedDocument;
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode(raw: (String, String, i64, i64)) -> Result<MaterializedDocument> {
    let (document_id, doc, version, timestamp) = raw;
    Ok(MaterializedDocument {
        document_id,
        doc: serde_json::from_str(&doc)?,
        version,
        timestamp,
    })
}

/// Fetch a single row.
pub fn get(
    conn: &Connection,
    collection: &str,
    document_id: &str,
) -> Result<Option<MaterializedDocument>> {
    let raw = conn
        .query_row(
            "SELECT document_id, doc, version, timestamp FROM documents
             WHERE collection = ? AND document_id = ?",
            params![collection, document_id],
            row_to_document,
        )
        .optional()?;

    raw.map(decode).transpose()
}

/// Insert or replace a row with the full document.
pub fn upsert(
    conn: &Connection,
    collection: &str,
    document_id: &str,
    doc: &serde_json::Value,
    version: i64,
    timestamp: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO documents (collection, document_id, doc, version, timestamp)
         VALUES (?, ?, ?, ?, ?)",
        params![
            collection,
            document_id,
            serde_json::to_string(doc)?,
            version,
            timestamp
        ],
    )?;
    Ok(())
}

/// Physically remove a row. Returns whether one existed.
pub fn delete(conn: &Connection, collection: &str, document_id: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM documents WHERE collection = ? AND document_id = ?",
        params![collection, document_id],
    )?;
    Ok(removed > 0)
}

/// All rows of a collection, ordered by document id.
pub fn list(conn: &Connection, collection: &str) -> Result<Vec<MaterializedDocument>> {
    let mut stmt = conn.prepare(
        "SELECT document_id, doc, version, timestamp FROM documents
         WHERE collection = ? ORDER BY document_id",
    )?;

    let rows: Vec<(String, String, i64, i64)> = stmt
        .query_map(params![collection], row_to_document)?
        .filter_map(|r| r.ok())
        .collect();

    rows.into_iter().map(decode).collect()
}

/// Number of live documents in a collection.
pub fn count(conn: &Connection, collection: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM documents WHERE collection = ?",
        params![collection],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_database;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_upsert_and_get() {
        let conn = conn();
        upsert(&conn, "tasks", "t1", &json!({ "id": "t1", "done": false }), 1, 1000).unwrap();

        let row = get(&conn, "tasks", "t1").unwrap().unwrap();
        assert_eq!(row.doc, json!({ "id": "t1", "done": false }));
        assert_eq!(row.version, 1);
        assert_eq!(row.timestamp, 1000);
    }

    #[test]
    fn test_upsert_replaces() {
        let conn = conn();
        upsert(&conn, "tasks", "t1", &json!({ "done": false }), 1, 1000).unwrap();
        upsert(&conn, "tasks", "t1", &json!({ "done": true }), 2, 2000).unwrap();

        let row = get(&conn, "tasks", "t1").unwrap().unwrap();
        assert_eq!(row.doc, json!({ "done": true }));
        assert_eq!(row.version, 2);
        assert_eq!(count(&conn, "tasks").unwrap(), 1);
    }

    #[test]
    fn test_delete() {
        let conn = conn();
        upsert(&conn, "tasks", "t1", &json!({}), 1, 1000).unwrap();

        assert!(delete(&conn, "tasks", "t1").unwrap());
        assert!(get(&conn, "tasks", "t1").unwrap().is_none());
        assert!(!delete(&conn, "tasks", "t1").unwrap());
    }

    #[test]
    fn test_list_is_ordered_and_scoped() {
        let conn = conn();
        upsert(&conn, "tasks", "b", &json!({ "id": "b" }), 1, 1).unwrap();
        upsert(&conn, "tasks", "a", &json!({ "id": "a" }), 1, 1).unwrap();
        upsert(&conn, "notes", "x", &json!({ "id": "x" }), 1, 1).unwrap();

        let rows = list(&conn, "tasks").unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(count(&conn, "notes").unwrap(), 1);
    }
}
