//! The authoritative replication store.
//!
//! Every mutation is one SQL transaction across the event log and the
//! materialized table; SQLite gives the all-or-nothing guarantee, so a
//! failed mutation leaves neither leg written and the client simply
//! retries the whole operation. The server never parses CRDT bytes for
//! conflict resolution; it merges them opaquely for snapshots and
//! coalesced diffs only.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use driftsync_core::crdt::codec;
use driftsync_core::{
    Checkpoint, DeleteDocumentRequest, InsertDocumentRequest, MutationMetadata, MutationResponse,
    OperationType, SsrRequest, SsrResponse, StreamEvent, StreamRequest, StreamResponse,
    UpdateDocumentRequest,
};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::{event_log, materialized, schema};
use crate::error::{Result, ServerError};
use crate::migrate::SchemaMigrations;

/// Default replay window tolerating out-of-order writes around a
/// reconnect (5 minutes).
pub const DEFAULT_BACKLOG_MS: i64 = 5 * 60 * 1000;

/// Default event count per stream response.
pub const DEFAULT_STREAM_LIMIT: usize = 100;

/// Protocol version this server speaks.
pub const SERVER_PROTOCOL_VERSION: u32 = 1;

/// Authoritative store backing all collections.
pub struct ReplicateStore {
    conn: Mutex<Connection>,
    migrations: HashMap<String, SchemaMigrations>,
    protocol_version: u32,
    backlog_ms: i64,
}

/// Outcome of a compaction run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionReport {
    /// Delta/diff records folded into the snapshot
    pub merged: usize,

    /// Timestamp of the produced snapshot, if one was written
    pub snapshot_timestamp: Option<i64>,
}

/// Outcome of a pruning run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub snapshots_removed: usize,
    pub deltas_removed: usize,
}

impl ReplicateStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory store for tests and embedding.
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::init_database(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            migrations: HashMap::new(),
            protocol_version: SERVER_PROTOCOL_VERSION,
            backlog_ms: DEFAULT_BACKLOG_MS,
        })
    }

    /// Register schema migrations for a collection.
    pub fn with_migrations(mut self, collection: &str, migrations: SchemaMigrations) -> Self {
        self.migrations.insert(collection.to_string(), migrations);
        self
    }

    /// Override the served protocol version.
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Override the stream backlog window.
    pub fn with_backlog_ms(mut self, backlog_ms: i64) -> Self {
        self.backlog_ms = backlog_ms;
        self
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn migrate_doc(
        &self,
        collection: &str,
        doc: serde_json::Value,
        schema_version: Option<u32>,
    ) -> Result<serde_json::Value> {
        match self.migrations.get(collection) {
            Some(migrations) => migrations.migrate(doc, schema_version),
            None => Ok(doc),
        }
    }

    fn validate_common(collection: &str, document_id: &str, crdt_bytes: &[u8]) -> Result<()> {
        if collection.is_empty() {
            return Err(ServerError::InvalidRequest("collection is empty".into()));
        }
        if document_id.is_empty() {
            return Err(ServerError::InvalidRequest("documentId is empty".into()));
        }
        if crdt_bytes.is_empty() {
            return Err(ServerError::InvalidRequest("crdtBytes is empty".into()));
        }
        Ok(())
    }

    fn metadata(
        collection: &str,
        document_id: &str,
        timestamp: i64,
        version: i64,
    ) -> MutationMetadata {
        MutationMetadata {
            document_id: document_id.to_string(),
            timestamp,
            version,
            collection: collection.to_string(),
        }
    }

    // ==================== Mutations (dual-storage) ====================

    /// Create a document: append the delta, materialize the row.
    pub fn insert_document(&self, request: InsertDocumentRequest) -> Result<MutationResponse> {
        Self::validate_common(&request.collection, &request.document_id, &request.crdt_bytes)?;
        if !request.materialized_doc.is_object() {
            return Err(ServerError::InvalidRequest(
                "materializedDoc must be a JSON object".into(),
            ));
        }
        let doc = self.migrate_doc(
            &request.collection,
            request.materialized_doc.clone(),
            request.schema_version,
        )?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let outcome = event_log::append(
            &tx,
            &request.collection,
            Some(&request.document_id),
            OperationType::Delta,
            &request.crdt_bytes,
            request.version,
            Self::now_ms(),
        )?;

        if outcome.deduplicated {
            tx.commit()?;
            tracing::debug!(
                collection = %request.collection,
                document_id = %request.document_id,
                "Deduplicated insert"
            );
            return Ok(MutationResponse {
                success: true,
                deduplicated: true,
                metadata: Some(Self::metadata(
                    &request.collection,
                    &request.document_id,
                    outcome.timestamp,
                    request.version,
                )),
            });
        }

        materialized::upsert(
            &tx,
            &request.collection,
            &request.document_id,
            &doc,
            request.version,
            outcome.timestamp,
        )?;
        tx.commit()?;

        tracing::debug!(
            collection = %request.collection,
            document_id = %request.document_id,
            version = request.version,
            "Inserted document"
        );
        Ok(MutationResponse {
            success: true,
            deduplicated: false,
            metadata: Some(Self::metadata(
                &request.collection,
                &request.document_id,
                outcome.timestamp,
                request.version,
            )),
        })
    }

    /// Patch a document: optimistic-concurrency check, append the delta,
    /// replace the row with the submitted full document.
    pub fn update_document(&self, request: UpdateDocumentRequest) -> Result<MutationResponse> {
        Self::validate_common(&request.collection, &request.document_id, &request.crdt_bytes)?;
        if !request.materialized_doc.is_object() {
            return Err(ServerError::InvalidRequest(
                "materializedDoc must be a JSON object".into(),
            ));
        }
        let doc = self.migrate_doc(
            &request.collection,
            request.materialized_doc.clone(),
            request.schema_version,
        )?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row = materialized::get(&tx, &request.collection, &request.document_id)?
            .ok_or_else(|| ServerError::NotFound(request.document_id.clone()))?;
        if let Some(expected) = request.version {
            if expected != row.version {
                return Err(ServerError::VersionConflict {
                    expected,
                    actual: row.version,
                });
            }
        }
        let new_version = row.version + 1;

        let outcome = event_log::append(
            &tx,
            &request.collection,
            Some(&request.document_id),
            OperationType::Delta,
            &request.crdt_bytes,
            new_version,
            Self::now_ms(),
        )?;

        if outcome.deduplicated {
            tx.commit()?;
            return Ok(MutationResponse {
                success: true,
                deduplicated: true,
                metadata: Some(Self::metadata(
                    &request.collection,
                    &request.document_id,
                    outcome.timestamp,
                    row.version,
                )),
            });
        }

        materialized::upsert(
            &tx,
            &request.collection,
            &request.document_id,
            &doc,
            new_version,
            outcome.timestamp,
        )?;
        tx.commit()?;

        tracing::debug!(
            collection = %request.collection,
            document_id = %request.document_id,
            version = new_version,
            "Updated document"
        );
        Ok(MutationResponse {
            success: true,
            deduplicated: false,
            metadata: Some(Self::metadata(
                &request.collection,
                &request.document_id,
                outcome.timestamp,
                new_version,
            )),
        })
    }

    /// Delete a document: append the deletion delta, remove the row. The
    /// delta stays in the event log so replicas learn of the removal.
    pub fn delete_document(&self, request: DeleteDocumentRequest) -> Result<MutationResponse> {
        Self::validate_common(&request.collection, &request.document_id, &request.crdt_bytes)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let row = materialized::get(&tx, &request.collection, &request.document_id)?
            .ok_or_else(|| ServerError::NotFound(request.document_id.clone()))?;
        if let Some(expected) = request.version {
            if expected != row.version {
                return Err(ServerError::VersionConflict {
                    expected,
                    actual: row.version,
                });
            }
        }
        let new_version = row.version + 1;

        let outcome = event_log::append(
            &tx,
            &request.collection,
            Some(&request.document_id),
            OperationType::Delta,
            &request.crdt_bytes,
            new_version,
            Self::now_ms(),
        )?;

        if !outcome.deduplicated {
            materialized::delete(&tx, &request.collection, &request.document_id)?;
        }
        tx.commit()?;

        tracing::debug!(
            collection = %request.collection,
            document_id = %request.document_id,
            "Deleted document"
        );
        Ok(MutationResponse {
            success: true,
            deduplicated: outcome.deduplicated,
            metadata: Some(Self::metadata(
                &request.collection,
                &request.document_id,
                outcome.timestamp,
                new_version,
            )),
        })
    }

    // ==================== Queries ====================

    /// Ordered events newer than the checkpoint.
    ///
    /// The backlog replay window applies only when the request carries a
    /// state vector, which clients send exactly once per session
    /// (re)connect; steady-state polls resume strictly after the
    /// checkpoint. When a vector is present the response may coalesce the
    /// whole window into one diff-against-vector event.
    pub fn stream(&self, request: StreamRequest) -> Result<StreamResponse> {
        let limit = request.limit.unwrap_or(DEFAULT_STREAM_LIMIT).clamp(1, 1000);
        let backlog = if request.vector.is_some() {
            self.backlog_ms
        } else {
            0
        };
        let since = request.checkpoint.last_modified - backlog;

        let conn = self.conn.lock().unwrap();
        let mut records = event_log::events_after(&conn, &request.collection, since, limit + 1)?;
        let has_more = records.len() > limit;
        if has_more {
            records.truncate(limit);
            // Keep whole timestamp groups together so the advancing
            // checkpoint can never skip a tied record.
            if let Some((last_timestamp, last_id)) = records.last().map(|e| (e.timestamp, e.id)) {
                let tail =
                    event_log::events_at(&conn, &request.collection, last_timestamp, last_id)?;
                records.extend(tail);
            }
        }

        let checkpoint = records
            .last()
            .map(|e| Checkpoint::new(e.timestamp))
            .unwrap_or(request.checkpoint);

        if let Some(vector) = &request.vector {
            if !records.is_empty() {
                if let Some(event) = self.coalesce(&conn, &request.collection, vector, &records) {
                    return Ok(StreamResponse {
                        changes: vec![event],
                        checkpoint,
                        has_more,
                    });
                }
            }
        }

        let changes = records
            .into_iter()
            .map(|record| StreamEvent {
                document_id: record.document_id,
                crdt_bytes: record.crdt_bytes,
                version: record.version,
                timestamp: record.timestamp,
                operation_type: record.operation_type,
            })
            .collect();

        Ok(StreamResponse {
            changes,
            checkpoint,
            has_more,
        })
    }

    /// Replay the full log and diff it against the client's state vector,
    /// collapsing the response into a single event. Falls back to the
    /// plain event list when anything fails to decode; correctness never
    /// depends on this path.
    fn coalesce(
        &self,
        conn: &Connection,
        collection: &str,
        vector: &[u8],
        records: &[event_log::EventRecord],
    ) -> Option<StreamEvent> {
        let all = event_log::all_events(conn, collection).ok()?;
        let doc = codec::new_doc(collection, 0);
        for record in &all {
            if codec::apply_update(&doc, &record.crdt_bytes, driftsync_core::Origin::Snapshot)
                .is_err()
            {
                return None;
            }
        }
        let diff = codec::encode_diff(&doc, vector).ok()?;

        Some(StreamEvent {
            document_id: None,
            crdt_bytes: diff,
            version: records.iter().map(|r| r.version).max().unwrap_or(0),
            timestamp: records.last().map(|r| r.timestamp).unwrap_or(0),
            operation_type: OperationType::Diff,
        })
    }

    /// Materialized documents as of the query, with the collection-wide
    /// CRDT state on request.
    pub fn ssr(&self, request: SsrRequest) -> Result<SsrResponse> {
        let conn = self.conn.lock().unwrap();
        let documents = materialized::list(&conn, &request.collection)?;
        let count = documents.len();

        let (checkpoint, crdt_bytes) = if request.include_crdt_state {
            let events = event_log::all_events(&conn, &request.collection)?;
            if events.is_empty() {
                (Some(Checkpoint::default()), None)
            } else {
                let latest = events.last().map(|e| e.timestamp).unwrap_or(0);
                let bytes: Vec<Vec<u8>> = events.into_iter().map(|e| e.crdt_bytes).collect();
                let merged = codec::merge_updates(&bytes)
                    .map_err(|e| ServerError::Codec(e.to_string()))?;
                (Some(Checkpoint::new(latest)), Some(merged))
            }
        } else {
            (None, None)
        };

        Ok(SsrResponse {
            documents,
            count,
            checkpoint,
            crdt_bytes,
        })
    }

    /// Protocol version served to clients.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    // ==================== Maintenance ====================

    /// Merge delta/diff records older than the retention cutoff into a
    /// single snapshot record.
    ///
    /// The snapshot's timestamp equals the newest merged record's, so
    /// stream consumers past that point never see it. Earlier snapshot
    /// records are folded into the merge (and left for pruning to drop);
    /// `document_id` survives only when every merged record agrees on it.
    pub fn compact(&self, collection: &str, retention_days: i64) -> Result<CompactionReport> {
        let cutoff = Self::now_ms() - retention_days * 24 * 60 * 60 * 1000;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let deltas = event_log::deltas_older_than(&tx, collection, cutoff)?;
        if deltas.len() < 2 {
            return Ok(CompactionReport {
                merged: 0,
                snapshot_timestamp: None,
            });
        }

        let snapshot_timestamp = deltas.last().map(|d| d.timestamp).unwrap_or(0);
        let version = deltas.iter().map(|d| d.version).max().unwrap_or(0);

        // Fold prior snapshots below the new snapshot's timestamp into the
        // merge so the result is the cumulative collection state.
        let prior_snapshots: Vec<event_log::EventRecord> =
            event_log::snapshots_newest_first(&tx, collection)?
                .into_iter()
                .filter(|s| s.timestamp <= snapshot_timestamp)
                .collect();

        let mut merged_records: Vec<&event_log::EventRecord> = Vec::new();
        merged_records.extend(prior_snapshots.iter());
        merged_records.extend(deltas.iter());

        let document_id = unanimous_document_id(&merged_records);
        let bytes: Vec<Vec<u8>> = merged_records
            .iter()
            .map(|r| r.crdt_bytes.clone())
            .collect();
        let merged =
            codec::merge_updates(&bytes).map_err(|e| ServerError::Codec(e.to_string()))?;

        event_log::append_at(
            &tx,
            collection,
            document_id.as_deref(),
            OperationType::Snapshot,
            &merged,
            version,
            snapshot_timestamp,
        )?;
        event_log::delete_by_ids(&tx, &deltas.iter().map(|d| d.id).collect::<Vec<_>>())?;

        tx.commit()?;

        tracing::info!(
            collection,
            merged = deltas.len(),
            snapshot_timestamp,
            "Compacted event log"
        );
        Ok(CompactionReport {
            merged: deltas.len(),
            snapshot_timestamp: Some(snapshot_timestamp),
        })
    }

    /// Remove snapshot records older than the retention window, always
    /// keeping the two most recent per collection, then drop deltas
    /// already superseded by the newest retained snapshot.
    pub fn prune(&self, collection: &str, retention_days: i64) -> Result<PruneReport> {
        let cutoff = Self::now_ms() - retention_days * 24 * 60 * 60 * 1000;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let snapshots = event_log::snapshots_newest_first(&tx, collection)?;
        let expired: Vec<i64> = snapshots
            .iter()
            .skip(2)
            .filter(|s| s.timestamp < cutoff)
            .map(|s| s.id)
            .collect();
        event_log::delete_by_ids(&tx, &expired)?;

        // A delta newer than the newest retained snapshot is not covered
        // by any snapshot and must survive.
        let newest_retained = snapshots
            .iter()
            .filter(|s| !expired.contains(&s.id))
            .map(|s| s.timestamp)
            .max();
        let deltas_removed = match newest_retained {
            Some(snapshot_timestamp) => {
                let superseded: Vec<i64> =
                    event_log::deltas_older_than(&tx, collection, snapshot_timestamp)?
                        .into_iter()
                        .filter(|d| d.timestamp < cutoff)
                        .map(|d| d.id)
                        .collect();
                event_log::delete_by_ids(&tx, &superseded)?;
                superseded.len()
            }
            None => 0,
        };

        tx.commit()?;

        tracing::info!(
            collection,
            snapshots_removed = expired.len(),
            deltas_removed,
            "Pruned event log"
        );
        Ok(PruneReport {
            snapshots_removed: expired.len(),
            deltas_removed,
        })
    }
}

impl std::fmt::Debug for ReplicateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicateStore")
            .field("protocol_version", &self.protocol_version)
            .field("backlog_ms", &self.backlog_ms)
            .finish_non_exhaustive()
    }
}

/// The shared document id of a record set, if they all agree.
fn unanimous_document_id(records: &[&event_log::EventRecord]) -> Option<String> {
    let mut ids = records.iter().map(|r| r.document_id.as_deref());
    let first = ids.next()??;
    for id in ids {
        if id != Some(first) {
            return None;
        }
    }
    Some(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::crdt::value::{map_to_json, set_field};
    use serde_json::{Value, json};
    use yrs::{Map, ReadTxn, Transact};

    /// A scratch client document for producing real deltas.
    struct Replica {
        doc: yrs::Doc,
        map: yrs::MapRef,
    }

    impl Replica {
        fn new(client_id: u64) -> Self {
            let doc = codec::new_doc("tasks", client_id);
            let map = doc.get_or_insert_map("documents");
            Self { doc, map }
        }

        fn set(&self, key: &str, value: Value) -> Vec<u8> {
            let sv = {
                let txn = self.doc.transact();
                txn.state_vector()
            };
            {
                let mut txn = self.doc.transact_mut();
                set_field(&self.map, &mut txn, key, &value);
            }
            let txn = self.doc.transact();
            txn.encode_state_as_update_v2(&sv)
        }

        fn remove(&self, key: &str) -> Vec<u8> {
            let sv = {
                let txn = self.doc.transact();
                txn.state_vector()
            };
            {
                let mut txn = self.doc.transact_mut();
                self.map.remove(&mut txn, key);
            }
            let txn = self.doc.transact();
            txn.encode_state_as_update_v2(&sv)
        }

        fn documents(&self) -> Value {
            let txn = self.doc.transact();
            map_to_json(&txn, &self.map)
        }
    }

    fn insert_request(key: &str, doc: Value, bytes: Vec<u8>) -> InsertDocumentRequest {
        InsertDocumentRequest {
            collection: "tasks".to_string(),
            document_id: key.to_string(),
            crdt_bytes: bytes,
            materialized_doc: doc,
            version: 1,
            schema_version: None,
        }
    }

    /// Replay the whole event log into a fresh doc and return its
    /// documents map as JSON.
    fn materialize_replay(store: &ReplicateStore, collection: &str) -> Value {
        let response = store
            .stream(StreamRequest {
                collection: collection.to_string(),
                checkpoint: Checkpoint::default(),
                vector: None,
                limit: Some(1000),
            })
            .unwrap();

        let replica = Replica::new(999);
        for event in &response.changes {
            codec::apply_update(
                &replica.doc,
                &event.crdt_bytes,
                driftsync_core::Origin::Snapshot,
            )
            .unwrap();
        }
        replica.documents()
    }

    #[test]
    fn test_insert_update_delete_round_trip() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(12345);

        // insert
        let bytes = replica.set("t1", json!({ "id": "t1", "text": "hi", "done": false }));
        let response = store
            .insert_document(insert_request(
                "t1",
                json!({ "id": "t1", "text": "hi", "done": false }),
                bytes,
            ))
            .unwrap();
        assert!(response.success);
        let metadata = response.metadata.unwrap();
        assert_eq!(metadata.version, 1);

        let ssr = store
            .ssr(SsrRequest {
                collection: "tasks".to_string(),
                include_crdt_state: false,
            })
            .unwrap();
        assert_eq!(ssr.count, 1);
        assert_eq!(
            ssr.documents[0].doc,
            json!({ "id": "t1", "text": "hi", "done": false })
        );

        // update
        let bytes = replica.set("t1", json!({ "id": "t1", "text": "hi", "done": true }));
        let response = store
            .update_document(UpdateDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "t1".to_string(),
                crdt_bytes: bytes,
                materialized_doc: json!({ "id": "t1", "text": "hi", "done": true }),
                version: Some(1),
                schema_version: None,
            })
            .unwrap();
        assert_eq!(response.metadata.unwrap().version, 2);

        // delete
        let bytes = replica.remove("t1");
        let response = store
            .delete_document(DeleteDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "t1".to_string(),
                crdt_bytes: bytes,
                version: Some(2),
                schema_version: None,
            })
            .unwrap();
        assert_eq!(response.metadata.unwrap().version, 3);

        let ssr = store
            .ssr(SsrRequest {
                collection: "tasks".to_string(),
                include_crdt_state: false,
            })
            .unwrap();
        assert_eq!(ssr.count, 0);

        // The event log holds all three deltas
        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::default(),
                vector: None,
                limit: None,
            })
            .unwrap();
        assert_eq!(response.changes.len(), 3);
        let versions: Vec<i64> = response.changes.iter().map(|c| c.version).collect();
        assert_eq!(versions, [1, 2, 3]);
    }

    #[test]
    fn test_resubmitting_identical_bytes_is_noop() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        let bytes = replica.set("t1", json!({ "id": "t1" }));
        store
            .insert_document(insert_request("t1", json!({ "id": "t1" }), bytes.clone()))
            .unwrap();

        // Same bytes, different materialized payload: deduplicated, row
        // untouched
        let response = store
            .insert_document(insert_request("t1", json!({ "id": "t1", "bogus": true }), bytes))
            .unwrap();
        assert!(response.deduplicated);

        let ssr = store
            .ssr(SsrRequest {
                collection: "tasks".to_string(),
                include_crdt_state: false,
            })
            .unwrap();
        assert_eq!(ssr.documents[0].doc, json!({ "id": "t1" }));
    }

    #[test]
    fn test_update_missing_document_fails() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        let err = store
            .update_document(UpdateDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "ghost".to_string(),
                crdt_bytes: replica.set("ghost", json!({ "id": "ghost" })),
                materialized_doc: json!({ "id": "ghost" }),
                version: None,
                schema_version: None,
            })
            .unwrap_err();

        assert!(matches!(err, ServerError::NotFound(_)));
    }

    #[test]
    fn test_version_conflict() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        let bytes = replica.set("t1", json!({ "id": "t1" }));
        store
            .insert_document(insert_request("t1", json!({ "id": "t1" }), bytes))
            .unwrap();

        let err = store
            .update_document(UpdateDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "t1".to_string(),
                crdt_bytes: replica.set("t1", json!({ "id": "t1", "n": 2 })),
                materialized_doc: json!({ "id": "t1", "n": 2 }),
                version: Some(7),
                schema_version: None,
            })
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::VersionConflict {
                expected: 7,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_failed_mutation_writes_neither_leg() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        let bytes = replica.set("t1", json!({ "id": "t1" }));
        store
            .insert_document(insert_request("t1", json!({ "id": "t1" }), bytes))
            .unwrap();
        let events_before = {
            let conn = store.conn.lock().unwrap();
            event_log::all_events(&conn, "tasks").unwrap().len()
        };

        let _ = store
            .update_document(UpdateDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "t1".to_string(),
                crdt_bytes: replica.set("t1", json!({ "id": "t1", "n": 1 })),
                materialized_doc: json!({ "id": "t1", "n": 1 }),
                version: Some(99),
                schema_version: None,
            })
            .unwrap_err();

        let conn = store.conn.lock().unwrap();
        assert_eq!(
            event_log::all_events(&conn, "tasks").unwrap().len(),
            events_before
        );
        assert_eq!(
            materialized::get(&conn, "tasks", "t1").unwrap().unwrap().version,
            1
        );
    }

    #[test]
    fn test_stream_applies_backlog_only_with_vector() {
        let store = ReplicateStore::in_memory().unwrap().with_backlog_ms(10_000);
        let replica = Replica::new(1);

        store
            .insert_document(insert_request(
                "t1",
                json!({ "id": "t1" }),
                replica.set("t1", json!({ "id": "t1" })),
            ))
            .unwrap();
        let timestamp = {
            let conn = store.conn.lock().unwrap();
            event_log::latest_timestamp(&conn, "tasks").unwrap()
        };

        // Checkpoint sits exactly at the event; a plain poll sees nothing
        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::new(timestamp),
                vector: None,
                limit: None,
            })
            .unwrap();
        assert!(response.changes.is_empty());
        assert_eq!(response.checkpoint.last_modified, timestamp);

        // A session-opening request (vector present) replays the backlog
        let vector = codec::state_vector(&codec::new_doc("tasks", 2));
        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::new(timestamp),
                vector: Some(vector),
                limit: None,
            })
            .unwrap();
        assert_eq!(response.changes.len(), 1);
    }

    #[test]
    fn test_stream_coalesces_into_diff_when_vector_present() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        for i in 0..3 {
            let key = format!("t{}", i);
            let doc = json!({ "id": key.clone(), "n": i });
            let bytes = replica.set(&key, doc.clone());
            store
                .insert_document(insert_request(&key, doc, bytes))
                .unwrap();
        }

        let empty = codec::new_doc("tasks", 2);
        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::default(),
                vector: Some(codec::state_vector(&empty)),
                limit: None,
            })
            .unwrap();

        assert_eq!(response.changes.len(), 1);
        let event = &response.changes[0];
        assert_eq!(event.operation_type, OperationType::Diff);
        assert!(event.document_id.is_none());

        // The single diff reconstructs all three documents
        codec::apply_update(&empty, &event.crdt_bytes, driftsync_core::Origin::Subscription)
            .unwrap();
        let map = empty.get_or_insert_map("documents");
        let txn = empty.transact();
        assert_eq!(map_to_json(&txn, &map).as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_stream_pagination_and_checkpoint_advance() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        for i in 0..5 {
            let key = format!("t{}", i);
            let doc = json!({ "id": key.clone() });
            let bytes = replica.set(&key, doc.clone());
            store
                .insert_document(insert_request(&key, doc, bytes))
                .unwrap();
        }

        let mut checkpoint = Checkpoint::default();
        let mut collected = 0;
        loop {
            let response = store
                .stream(StreamRequest {
                    collection: "tasks".to_string(),
                    checkpoint,
                    vector: None,
                    limit: Some(2),
                })
                .unwrap();
            collected += response.changes.len();
            checkpoint = response.checkpoint;
            if !response.has_more {
                break;
            }
        }

        assert!(collected >= 5);
    }

    #[test]
    fn test_ssr_with_crdt_state() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        store
            .insert_document(insert_request(
                "t1",
                json!({ "id": "t1", "text": "hi" }),
                replica.set("t1", json!({ "id": "t1", "text": "hi" })),
            ))
            .unwrap();

        let response = store
            .ssr(SsrRequest {
                collection: "tasks".to_string(),
                include_crdt_state: true,
            })
            .unwrap();

        assert_eq!(response.count, 1);
        let checkpoint = response.checkpoint.unwrap();
        assert!(checkpoint.last_modified > 0);

        let fresh = Replica::new(2);
        codec::apply_update(
            &fresh.doc,
            &response.crdt_bytes.unwrap(),
            driftsync_core::Origin::SsrInit,
        )
        .unwrap();
        assert_eq!(
            fresh.documents(),
            json!({ "t1": { "id": "t1", "text": "hi" } })
        );
    }

    #[test]
    fn test_schema_migrations_run_before_store() {
        fn add_done(mut doc: Value) -> Result<Value> {
            if let Some(fields) = doc.as_object_mut() {
                fields.entry("done").or_insert(json!(false));
            }
            Ok(doc)
        }

        let store = ReplicateStore::in_memory()
            .unwrap()
            .with_migrations("tasks", SchemaMigrations::new(2).step(1, add_done));
        let replica = Replica::new(1);

        let mut request = insert_request(
            "t1",
            json!({ "id": "t1" }),
            replica.set("t1", json!({ "id": "t1" })),
        );
        request.schema_version = Some(1);
        store.insert_document(request).unwrap();

        let ssr = store
            .ssr(SsrRequest {
                collection: "tasks".to_string(),
                include_crdt_state: false,
            })
            .unwrap();
        assert_eq!(ssr.documents[0].doc, json!({ "id": "t1", "done": false }));

        // A version with no registered step is rejected
        let mut request = insert_request(
            "t2",
            json!({ "id": "t2" }),
            replica.set("t2", json!({ "id": "t2" })),
        );
        request.schema_version = Some(0);
        let err = store.insert_document(request).unwrap_err();
        assert!(matches!(err, ServerError::MissingMigration { from: 0 }));
    }

    #[test]
    fn test_compaction_preserves_replayed_state() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        for i in 0..12 {
            let key = format!("t{}", i);
            let doc = json!({ "id": key.clone(), "n": i });
            let bytes = replica.set(&key, doc.clone());
            store
                .insert_document(insert_request(&key, doc, bytes))
                .unwrap();
        }
        let before = materialize_replay(&store, "tasks");
        assert_eq!(before.as_object().unwrap().len(), 12);

        // Everything is older than a cutoff in the future
        let report = store.compact("tasks", -1).unwrap();
        assert_eq!(report.merged, 12);
        assert!(report.snapshot_timestamp.is_some());

        // One snapshot remains and replays to the same state
        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::default(),
                vector: None,
                limit: None,
            })
            .unwrap();
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].operation_type, OperationType::Snapshot);
        assert_eq!(materialize_replay(&store, "tasks"), before);
    }

    #[test]
    fn test_compaction_keeps_shared_document_id_only_when_unanimous() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        store
            .insert_document(insert_request(
                "t1",
                json!({ "id": "t1", "n": 0 }),
                replica.set("t1", json!({ "id": "t1", "n": 0 })),
            ))
            .unwrap();
        store
            .update_document(UpdateDocumentRequest {
                collection: "tasks".to_string(),
                document_id: "t1".to_string(),
                crdt_bytes: replica.set("t1", json!({ "id": "t1", "n": 1 })),
                materialized_doc: json!({ "id": "t1", "n": 1 }),
                version: Some(1),
                schema_version: None,
            })
            .unwrap();

        store.compact("tasks", -1).unwrap();

        let response = store
            .stream(StreamRequest {
                collection: "tasks".to_string(),
                checkpoint: Checkpoint::default(),
                vector: None,
                limit: None,
            })
            .unwrap();
        assert_eq!(response.changes.len(), 1);
        assert_eq!(response.changes[0].document_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_prune_keeps_two_snapshots_and_newer_deltas() {
        let store = ReplicateStore::in_memory().unwrap();
        let replica = Replica::new(1);

        // Three old snapshots planted directly in the log
        {
            let conn = store.conn.lock().unwrap();
            for (i, ts) in [(0i64, 1000i64), (1, 2000), (2, 3000)] {
                event_log::append_at(
                    &conn,
                    "tasks",
                    None,
                    OperationType::Snapshot,
                    format!("snapshot-{}", i).as_bytes(),
                    i,
                    ts,
                )
                .unwrap();
            }
        }
        // A current delta, far newer than any snapshot
        store
            .insert_document(insert_request(
                "t1",
                json!({ "id": "t1" }),
                replica.set("t1", json!({ "id": "t1" })),
            ))
            .unwrap();

        let report = store.prune("tasks", 0).unwrap();

        // Oldest snapshot went; the two newest stayed
        assert_eq!(report.snapshots_removed, 1);
        let conn = store.conn.lock().unwrap();
        let snapshots = event_log::snapshots_newest_first(&conn, "tasks").unwrap();
        assert_eq!(snapshots.len(), 2);
        // The fresh delta is newer than every retained snapshot and
        // survives
        let events = event_log::all_events(&conn, "tasks").unwrap();
        assert!(events
            .iter()
            .any(|e| e.operation_type == OperationType::Delta));
    }
}

