//! Append-only CRDT event log.
//!
//! Records are keyed by `(collection, timestamp)` with insertion order
//! breaking ties. They are never updated; only pruning (after a
//! superseding snapshot) removes them. `(collection, hash)` deduplicates
//! identical payloads: re-submitting the same bytes is a no-op.
//!
//! All functions take a plain connection so mutation handlers can run
//! them inside their dual-storage SQL transaction.

use driftsync_core::OperationType;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// One record of the event log.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: i64,
    pub collection: String,
    /// Absent for collection-wide snapshots
    pub document_id: Option<String>,
    pub operation_type: OperationType,
    pub crdt_bytes: Vec<u8>,
    pub version: i64,
    pub timestamp: i64,
    pub hash: String,
    pub size: i64,
}

/// Outcome of an append.
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    /// True when identical bytes were already logged; nothing was written
    pub deduplicated: bool,

    /// Timestamp of the (existing or new) record
    pub timestamp: i64,
}

/// Content hash used for `(collection, hash)` deduplication.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Append a record, deduplicating on `(collection, hash)` and clamping
/// the timestamp so it never decreases within a collection.
pub fn append(
    conn: &Connection,
    collection: &str,
    document_id: Option<&str>,
    operation_type: OperationType,
    crdt_bytes: &[u8],
    version: i64,
    now: i64,
) -> Result<AppendOutcome> {
    let timestamp = now.max(latest_timestamp(conn, collection)?);
    append_at(
        conn,
        collection,
        document_id,
        operation_type,
        crdt_bytes,
        version,
        timestamp,
    )
}

/// Append a record at an exact timestamp, bypassing the monotonic clamp.
///
/// Used by compaction, whose snapshot must carry the newest merged
/// record's timestamp even though newer deltas already exist in the log.
pub fn append_at(
    conn: &Connection,
    collection: &str,
    document_id: Option<&str>,
    operation_type: OperationType,
    crdt_bytes: &[u8],
    version: i64,
    timestamp: i64,
) -> Result<AppendOutcome> {
    let hash = content_hash(crdt_bytes);

    let existing: Option<i64> = conn
        .query_row(
            "SELECT timestamp FROM events WHERE collection = ? AND hash = ?",
            params![collection, hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(timestamp) = existing {
        return Ok(AppendOutcome {
            deduplicated: true,
            timestamp,
        });
    }

    conn.execute(
        "INSERT INTO events (collection, document_id, operation_type, crdt_bytes, version, timestamp, hash, size)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            collection,
            document_id,
            operation_type.to_string(),
            crdt_bytes,
            version,
            timestamp,
            hash,
            crdt_bytes.len() as i64
        ],
    )?;

    Ok(AppendOutcome {
        deduplicated: false,
        timestamp,
    })
}

/// Newest event timestamp for a collection, 0 when the log is empty.
pub fn latest_timestamp(conn: &Connection, collection: &str) -> Result<i64> {
    let timestamp: Option<i64> = conn.query_row(
        "SELECT MAX(timestamp) FROM events WHERE collection = ?",
        params![collection],
        |row| row.get(0),
    )?;
    Ok(timestamp.unwrap_or(0))
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let operation_type: String = row.get(3)?;
    Ok(EventRecord {
        id: row.get(0)?,
        collection: row.get(1)?,
        document_id: row.get(2)?,
        operation_type: operation_type.parse().unwrap_or(OperationType::Delta),
        crdt_bytes: row.get(4)?,
        version: row.get(5)?,
        timestamp: row.get(6)?,
        hash: row.get(7)?,
        size: row.get(8)?,
    })
}

const RECORD_COLUMNS: &str =
    "id, collection, document_id, operation_type, crdt_bytes, version, timestamp, hash, size";

/// Events with `timestamp > since`, ascending `(timestamp, id)`, at most
/// `limit`.
pub fn events_after(
    conn: &Connection,
    collection: &str,
    since: i64,
    limit: usize,
) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM events
         WHERE collection = ? AND timestamp > ?
         ORDER BY timestamp ASC, id ASC
         LIMIT ?"
    ))?;

    let events = stmt
        .query_map(params![collection, since, limit], record_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(events)
}

/// The full log of a collection in replay order.
pub fn all_events(conn: &Connection, collection: &str) -> Result<Vec<EventRecord>> {
    events_after(conn, collection, -1, usize::MAX >> 1)
}

/// Remaining records of one timestamp group, after the given row id.
///
/// Stream responses keep tied timestamps together so an advancing
/// checkpoint cannot skip half a group.
pub fn events_at(
    conn: &Connection,
    collection: &str,
    timestamp: i64,
    after_id: i64,
) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM events
         WHERE collection = ? AND timestamp = ? AND id > ?
         ORDER BY id ASC"
    ))?;

    let events = stmt
        .query_map(params![collection, timestamp, after_id], record_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(events)
}

/// Delta and diff records with `timestamp <= cutoff`, in replay order.
pub fn deltas_older_than(
    conn: &Connection,
    collection: &str,
    cutoff: i64,
) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM events
         WHERE collection = ? AND timestamp <= ? AND operation_type IN ('delta', 'diff')
         ORDER BY timestamp ASC, id ASC"
    ))?;

    let events = stmt
        .query_map(params![collection, cutoff], record_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(events)
}

/// Snapshot records of a collection, newest first.
pub fn snapshots_newest_first(conn: &Connection, collection: &str) -> Result<Vec<EventRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECORD_COLUMNS} FROM events
         WHERE collection = ? AND operation_type = 'snapshot'
         ORDER BY timestamp DESC, id DESC"
    ))?;

    let events = stmt
        .query_map(params![collection], record_from_row)?
        .filter_map(|r| r.ok())
        .collect();
    Ok(events)
}

/// Physically remove records by id.
pub fn delete_by_ids(conn: &Connection, ids: &[i64]) -> Result<()> {
    let mut stmt = conn.prepare("DELETE FROM events WHERE id = ?")?;
    for id in ids {
        stmt.execute(params![id])?;
    }
    Ok(())
}
