//! Replicated collection handle.
//!
//! [`Collection`] ties the pieces together for one collection: the CRDT
//! store, the reactive bridge, the sync engine, and the offline queue.
//! Its mutation handlers apply changes optimistically to the local CRDT,
//! then ship the captured delta to the server; retriable transport
//! failures land in the offline queue for replay on reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::crdt::CollectionStore;
use crate::error::{ReplicateError, Result};
use crate::storage::LocalStore;
use crate::sync::bridge::{ReactiveBridge, ReactiveSink};
use crate::sync::engine::{SsrPayload, SyncConfig, SyncEngine};
use crate::sync::protocol::ProtocolGate;
use crate::sync::registry;
use crate::sync::retry::{DrainOutcome, OfflineQueue, QueuedOp};
use crate::sync::transport::{
    DeleteDocumentRequest, ErrorClass, InsertDocumentRequest, MutationResponse, ReplicateClient,
    UpdateDocumentRequest,
};

/// Options for opening a collection.
#[derive(Clone)]
pub struct CollectionOptions {
    /// Collection name (also the local storage key space)
    pub name: String,

    /// Schema version stamped onto outgoing mutations, for server-side
    /// document migrations
    pub schema_version: Option<u32>,

    /// Sync engine tunables
    pub sync: SyncConfig,

    /// Protocol gate; defaults to the process-wide gate
    pub gate: Option<Arc<ProtocolGate>>,

    /// Register in the process-wide registry so re-creating the
    /// collection under the same name tears down the previous instance.
    /// Disable when intentionally running several client instances of
    /// one collection in a single process (simulations, tests).
    pub hot_reload: bool,
}

impl CollectionOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema_version: None,
            sync: SyncConfig::default(),
            gate: None,
            hot_reload: true,
        }
    }
}

/// What happened to a mutation at the transport boundary.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
    /// The server accepted the mutation
    Applied(MutationResponse),

    /// A retriable failure occurred; the mutation sits in the offline
    /// queue and the optimistic local change stands
    Queued,
}

/// A replicated collection of documents.
pub struct Collection {
    name: String,
    store: Arc<CollectionStore>,
    engine: Arc<SyncEngine>,
    client: Arc<dyn ReplicateClient>,
    queue: Arc<OfflineQueue>,
    versions: Arc<Mutex<HashMap<String, i64>>>,
    schema_version: Option<u32>,
    hot_reload: bool,
    _observer: yrs::Subscription,
}

impl Collection {
    /// Open a collection and start replication.
    ///
    /// Re-opening a collection under the same name first tears down the
    /// previous instance (subscription cancelled, persistence detached),
    /// making hot re-creation idempotent.
    pub async fn open(
        storage: Arc<dyn LocalStore>,
        client: Arc<dyn ReplicateClient>,
        sink: Arc<dyn ReactiveSink>,
        options: CollectionOptions,
        ssr: Option<SsrPayload>,
    ) -> Result<Arc<Self>> {
        if options.hot_reload {
            registry::cleanup(&options.name);
        }

        let store = Arc::new(CollectionStore::open(storage.clone(), &options.name)?);
        let bridge = ReactiveBridge::new();
        let observer = bridge.observe(&store);
        bridge.attach_sink(sink);

        let versions: Arc<Mutex<HashMap<String, i64>>> = Arc::new(Mutex::new(HashMap::new()));
        let gate = options.gate.unwrap_or_else(ProtocolGate::global);
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            storage.clone(),
            client.clone(),
            bridge.clone(),
            gate,
            versions.clone(),
            options.sync,
        ));
        let queue = Arc::new(OfflineQueue::load(storage, &options.name));

        let started = engine.start(ssr).await;

        let collection = Arc::new(Self {
            name: options.name.clone(),
            store,
            engine: engine.clone(),
            client,
            queue,
            versions,
            schema_version: options.schema_version,
            hot_reload: options.hot_reload,
            _observer: observer,
        });

        if options.hot_reload {
            registry::register(&options.name, Box::new(move || engine.shutdown()));
        }

        started?;
        Ok(collection)
    }

    /// Generate a fresh document key.
    pub fn generate_document_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // ==================== Mutations ====================

    /// Insert a document.
    ///
    /// The record is applied optimistically to the local CRDT, then the
    /// captured delta and the full document are shipped to the server.
    pub async fn insert(&self, key: &str, record: Value) -> Result<MutationOutcome> {
        self.engine.ready().await?;

        let delta = self.store.insert(key, &record)?;
        let materialized = delta.document.unwrap_or(record);

        self.send(QueuedOp::Insert(InsertDocumentRequest {
            collection: self.name.clone(),
            document_id: key.to_string(),
            crdt_bytes: delta.bytes,
            materialized_doc: materialized,
            version: 1,
            schema_version: self.schema_version,
        }))
        .await
    }

    /// Patch fields of an existing document.
    ///
    /// The server receives the full merged document after the local
    /// transaction. No expected version is attached: conflict resolution
    /// belongs to the CRDT, and a version check would reject offline
    /// replays that merge cleanly. Callers that want strict optimistic
    /// concurrency can read [`server_version`](Self::server_version) and
    /// issue the transport request themselves.
    pub async fn update(&self, key: &str, patch: Value) -> Result<MutationOutcome> {
        self.engine.ready().await?;

        let delta = self.store.update(key, &patch)?;
        if delta.is_empty() {
            return Err(ReplicateError::MissingDocument(key.to_string()));
        }
        let materialized = delta
            .document
            .ok_or_else(|| ReplicateError::MissingDocument(key.to_string()))?;

        self.send(QueuedOp::Update(UpdateDocumentRequest {
            collection: self.name.clone(),
            document_id: key.to_string(),
            crdt_bytes: delta.bytes,
            materialized_doc: materialized,
            version: None,
            schema_version: self.schema_version,
        }))
        .await
    }

    /// Delete a document.
    pub async fn delete(&self, key: &str) -> Result<MutationOutcome> {
        self.engine.ready().await?;

        let delta = self.store.delete(key)?;
        if delta.is_empty() {
            return Err(ReplicateError::MissingDocument(key.to_string()));
        }

        self.send(QueuedOp::Delete(DeleteDocumentRequest {
            collection: self.name.clone(),
            document_id: key.to_string(),
            crdt_bytes: delta.bytes,
            version: None,
            schema_version: self.schema_version,
        }))
        .await
    }

    /// Replay the offline queue; call on the `online` event or any other
    /// observed reconnect.
    pub async fn on_online(&self) -> Result<DrainOutcome> {
        self.engine.ready().await?;
        Ok(self.queue.drain(self.client.as_ref()).await)
    }

    // ==================== Reads ====================

    /// Get a document as plain JSON.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    /// The full document mapping, ordered by key.
    pub fn documents(&self) -> indexmap::IndexMap<String, Value> {
        self.store.documents()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> u64 {
        self.store.client_id()
    }

    /// The underlying CRDT store.
    pub fn store(&self) -> &Arc<CollectionStore> {
        &self.store
    }

    /// The offline mutation queue.
    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.queue
    }

    /// Await sync startup (mutations do this implicitly).
    pub async fn ready(&self) -> Result<()> {
        self.engine.ready().await
    }

    /// Tear the collection down: cancel the subscription and drop the
    /// registry entry.
    pub fn close(&self) {
        if self.hot_reload {
            registry::cleanup(&self.name);
        }
        self.engine.shutdown();
    }

    /// The last server version observed for a document, from SSR data,
    /// stream events, and mutation acks. Strict optimistic-concurrency
    /// callers pass it as `expectedVersion` on hand-built requests.
    pub fn server_version(&self, key: &str) -> Option<i64> {
        self.versions.lock().unwrap().get(key).copied()
    }

    /// Ship a mutation, classifying failures: auth/validation propagate,
    /// anything else lands in the offline queue.
    async fn send(&self, op: QueuedOp) -> Result<MutationOutcome> {
        match op.dispatch(self.client.as_ref()).await {
            Ok(response) => {
                let mut versions = self.versions.lock().unwrap();
                match (&op, &response.metadata) {
                    (QueuedOp::Delete(_), _) => {
                        versions.remove(op.document_id());
                    }
                    (_, Some(metadata)) => {
                        versions.insert(op.document_id().to_string(), metadata.version);
                    }
                    _ => {}
                }
                Ok(MutationOutcome::Applied(response))
            }
            Err(e) if e.class() == ErrorClass::Retriable => {
                log::info!(
                    "Mutation for '{}' failed ({}), queued for retry",
                    op.document_id(),
                    e
                );
                self.queue.enqueue(op);
                Ok(MutationOutcome::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::result::Result;
    use crate::storage::MemoryStore;
    use crate::sync::bridge::WriteMessage;
    use crate::sync::transport::{
        Checkpoint, SsrRequest, SsrResponse, StreamRequest, StreamResponse, TransportError,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct NullSink;

    impl ReactiveSink for NullSink {
        fn begin(&self) {}
        fn write(&self, _message: WriteMessage) {}
        fn commit(&self) {}
        fn truncate(&self) {}
        fn mark_ready(&self) {}
    }

    /// Accepts every mutation and records the requests.
    #[derive(Default)]
    struct AcceptingClient {
        offline: AtomicBool,
        inserts: Mutex<Vec<InsertDocumentRequest>>,
        updates: Mutex<Vec<UpdateDocumentRequest>>,
        deletes: Mutex<Vec<DeleteDocumentRequest>>,
    }

    impl AcceptingClient {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> Result<(), TransportError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(TransportError::network("offline"))
            } else {
                Ok(())
            }
        }

        fn ack(&self, document_id: &str, version: i64) -> MutationResponse {
            MutationResponse {
                success: true,
                deduplicated: false,
                metadata: Some(crate::sync::transport::MutationMetadata {
                    document_id: document_id.to_string(),
                    timestamp: 1,
                    version,
                    collection: "tasks".to_string(),
                }),
            }
        }
    }

    #[async_trait]
    impl ReplicateClient for AcceptingClient {
        async fn insert_document(
            &self,
            request: InsertDocumentRequest,
        ) -> Result<MutationResponse, TransportError> {
            self.check_online()?;
            let response = self.ack(&request.document_id, request.version);
            self.inserts.lock().unwrap().push(request);
            Ok(response)
        }

        async fn update_document(
            &self,
            request: UpdateDocumentRequest,
        ) -> Result<MutationResponse, TransportError> {
            self.check_online()?;
            let response = self.ack(&request.document_id, request.version.unwrap_or(0) + 1);
            self.updates.lock().unwrap().push(request);
            Ok(response)
        }

        async fn delete_document(
            &self,
            request: DeleteDocumentRequest,
        ) -> Result<MutationResponse, TransportError> {
            self.check_online()?;
            let response = self.ack(&request.document_id, request.version.unwrap_or(0) + 1);
            self.deletes.lock().unwrap().push(request);
            Ok(response)
        }

        async fn stream(&self, request: StreamRequest) -> Result<StreamResponse, TransportError> {
            Ok(StreamResponse {
                changes: Vec::new(),
                checkpoint: request.checkpoint,
                has_more: false,
            })
        }

        async fn ssr(&self, _request: SsrRequest) -> Result<SsrResponse, TransportError> {
            Ok(SsrResponse {
                documents: Vec::new(),
                count: 0,
                checkpoint: Some(Checkpoint::default()),
                crdt_bytes: None,
            })
        }

        async fn protocol_version(&self) -> Result<u32, TransportError> {
            Ok(1)
        }
    }

    fn options(name: &str) -> CollectionOptions {
        let mut options = CollectionOptions::new(name);
        options.sync.poll_interval = Duration::from_millis(10);
        options.sync.resubscribe_backoff = Duration::from_millis(10);
        options.gate = Some(Arc::new(ProtocolGate::new()));
        options
    }

    async fn open_collection(
        name: &str,
        client: Arc<AcceptingClient>,
    ) -> (Arc<Collection>, Arc<MemoryStore>) {
        let storage = Arc::new(MemoryStore::new());
        let collection = Collection::open(
            storage.clone(),
            client,
            Arc::new(NullSink),
            options(name),
            None,
        )
        .await
        .unwrap();
        (collection, storage)
    }

    #[tokio::test]
    async fn test_insert_applies_locally_and_ships_delta() {
        let client = AcceptingClient::new();
        let (collection, _) = open_collection("col-insert", client.clone()).await;

        let outcome = collection
            .insert("t1", json!({ "id": "t1", "text": "hi" }))
            .await
            .unwrap();

        assert!(matches!(outcome, MutationOutcome::Applied(_)));
        assert_eq!(collection.get("t1"), Some(json!({ "id": "t1", "text": "hi" })));

        let inserts = client.inserts.lock().unwrap();
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].document_id, "t1");
        assert_eq!(inserts[0].version, 1);
        assert!(!inserts[0].crdt_bytes.is_empty());
        assert_eq!(inserts[0].materialized_doc, json!({ "id": "t1", "text": "hi" }));
        collection.close();
    }

    #[tokio::test]
    async fn test_update_sends_full_document() {
        let client = AcceptingClient::new();
        let (collection, _) = open_collection("col-update", client.clone()).await;

        collection
            .insert("t1", json!({ "id": "t1", "text": "hi", "done": false }))
            .await
            .unwrap();
        collection.update("t1", json!({ "done": true })).await.unwrap();

        {
            let updates = client.updates.lock().unwrap();
            assert_eq!(updates.len(), 1);
            // Full merged document, not the partial patch
            assert_eq!(
                updates[0].materialized_doc,
                json!({ "id": "t1", "text": "hi", "done": true })
            );
            // The CRDT owns conflict resolution; no version check attached
            assert_eq!(updates[0].version, None);
        }
        // The insert ack seeded the observed server version
        assert_eq!(collection.server_version("t1"), Some(1));
        collection.close();
    }

    #[tokio::test]
    async fn test_update_unknown_key_fails_without_network_call() {
        let client = AcceptingClient::new();
        let (collection, _) = open_collection("col-missing", client.clone()).await;

        let err = collection
            .update("ghost", json!({ "done": true }))
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicateError::MissingDocument(_)));
        assert!(client.updates.lock().unwrap().is_empty());
        collection.close();
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued_and_drained() {
        let client = AcceptingClient::new();
        let (collection, _) = open_collection("col-offline", client.clone()).await;

        client.set_offline(true);
        let outcome = collection
            .insert("t1", json!({ "id": "t1" }))
            .await
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Queued));
        // Optimistic change stands while the server call waits
        assert!(collection.contains("t1"));
        assert_eq!(collection.offline_queue().len(), 1);

        client.set_offline(false);
        let drained = collection.on_online().await.unwrap();
        assert_eq!(drained.applied, 1);
        assert!(collection.offline_queue().is_empty());
        assert_eq!(client.inserts.lock().unwrap().len(), 1);
        collection.close();
    }

    #[tokio::test]
    async fn test_reopen_runs_previous_cleanup() {
        let client = AcceptingClient::new();
        let storage = Arc::new(MemoryStore::new());

        let first = Collection::open(
            storage.clone(),
            client.clone(),
            Arc::new(NullSink),
            options("col-hmr"),
            None,
        )
        .await
        .unwrap();
        let id = first.client_id();

        // Re-creating under the same name must succeed and reuse identity
        let second = Collection::open(
            storage.clone(),
            client,
            Arc::new(NullSink),
            options("col-hmr"),
            None,
        )
        .await
        .unwrap();

        assert_eq!(second.client_id(), id);
        second.close();
    }
}
