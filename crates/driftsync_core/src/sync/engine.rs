//! Sync engine: subscribes to the server delta stream, applies remote
//! updates, and drives startup reconciliation.
//!
//! # Startup sequence
//!
//! 1. Await the protocol gate.
//! 2. Apply caller-supplied SSR CRDT state (origin `ssr-init`) and save
//!    its checkpoint.
//! 3. Reconcile against the server's materialized document set: local
//!    keys the server does not hold are removed under origin
//!    `reconciliation`, with their pre-images staged for the bridge.
//! 4. Spawn the stream subscription task; each session loads the
//!    checkpoint from durable storage and sends the current state vector
//!    exactly once.
//! 5. Signal the ready barrier and `mark_ready` on the sink (the latter
//!    even when initialization failed).
//!
//! Stream errors trigger an automatic resubscribe after a backoff; the
//! new session re-reads the persisted checkpoint, never a cached one,
//! and the server's backlog replay window covers out-of-order writes
//! around the reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use super::bridge::ReactiveBridge;
use super::checkpoint::CheckpointStore;
use super::protocol::ProtocolGate;
use super::transport::{
    Checkpoint, MaterializedDocument, OperationType, ReplicateClient, SsrRequest, StreamEvent,
    StreamRequest,
};
use crate::crdt::{CollectionStore, Origin};
use crate::error::{ReplicateError, Result};
use crate::storage::LocalStore;

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum events per stream request
    pub stream_limit: usize,

    /// Delay between polls when the server reports no more events
    pub poll_interval: Duration,

    /// Delay before resubscribing after a stream error
    pub resubscribe_backoff: Duration,

    /// Local update-log length that triggers storage compaction
    pub compact_keep_updates: usize,

    /// Reconcile against the server's materialized set on startup when no
    /// SSR payload was supplied
    pub reconcile: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_limit: 100,
            poll_interval: Duration::from_secs(1),
            resubscribe_backoff: Duration::from_secs(2),
            compact_keep_updates: 200,
            reconcile: true,
        }
    }
}

/// Server-rendered initial data handed to the engine at startup.
#[derive(Debug, Clone, Default)]
pub struct SsrPayload {
    /// Materialized documents as of the SSR query
    pub documents: Vec<MaterializedDocument>,

    /// Collection-wide CRDT state, applied under origin `ssr-init`
    pub crdt_bytes: Option<Vec<u8>>,

    /// Checkpoint accompanying `crdt_bytes`
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, PartialEq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Drives replication for one collection.
pub struct SyncEngine {
    store: Arc<CollectionStore>,
    storage: Arc<dyn LocalStore>,
    client: Arc<dyn ReplicateClient>,
    bridge: Arc<ReactiveBridge>,
    checkpoints: CheckpointStore,
    gate: Arc<ProtocolGate>,
    versions: Arc<Mutex<HashMap<String, i64>>>,
    config: SyncConfig,
    ready: watch::Sender<ReadyState>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<CollectionStore>,
        storage: Arc<dyn LocalStore>,
        client: Arc<dyn ReplicateClient>,
        bridge: Arc<ReactiveBridge>,
        gate: Arc<ProtocolGate>,
        versions: Arc<Mutex<HashMap<String, i64>>>,
        config: SyncConfig,
    ) -> Self {
        let (ready, _) = watch::channel(ReadyState::Pending);
        let (stop, _) = watch::channel(false);
        Self {
            checkpoints: CheckpointStore::new(storage.clone()),
            store,
            storage,
            client,
            bridge,
            gate,
            versions,
            config,
            ready,
            stop,
            task: Mutex::new(None),
        }
    }

    /// Run startup and open the stream subscription.
    ///
    /// The sink's `mark_ready` fires regardless of the outcome so the UI
    /// never hangs in a loading state; the ready barrier replays the
    /// failure to awaiting mutations instead.
    pub async fn start(&self, ssr: Option<SsrPayload>) -> Result<()> {
        let result = self.initialize(ssr).await;
        match &result {
            Ok(()) => {
                self.ready.send_replace(ReadyState::Ready);
            }
            Err(e) => {
                log::error!(
                    "Sync initialization failed for collection '{}': {}",
                    self.store.collection(),
                    e
                );
                self.ready.send_replace(ReadyState::Failed(e.to_string()));
            }
        }
        self.bridge.mark_ready();
        result
    }

    async fn initialize(&self, ssr: Option<SsrPayload>) -> Result<()> {
        let collection = self.store.collection().to_string();

        self.gate
            .ensure_ready(self.storage.as_ref(), self.client.as_ref())
            .await?;

        let materialized = match ssr {
            Some(payload) => {
                if let Some(bytes) = &payload.crdt_bytes {
                    self.store.apply_remote(bytes, Origin::SsrInit)?;
                }
                if let Some(checkpoint) = &payload.checkpoint {
                    self.checkpoints.save(&collection, checkpoint)?;
                }
                Some(payload.documents)
            }
            None if self.config.reconcile => {
                let response = self
                    .client
                    .ssr(SsrRequest {
                        collection: collection.clone(),
                        include_crdt_state: false,
                    })
                    .await?;
                Some(response.documents)
            }
            None => None,
        };

        if let Some(documents) = materialized {
            seed_versions(&self.versions, &documents);
            self.reconcile(&documents)?;
        }

        if let Err(e) = self.store.persist_snapshot() {
            log::warn!("Failed to persist startup state for '{}': {}", collection, e);
        }

        self.spawn_stream_loop();
        Ok(())
    }

    /// Remove local documents absent from the server's materialized set.
    fn reconcile(&self, documents: &[MaterializedDocument]) -> Result<()> {
        let live: HashSet<&str> = documents.iter().map(|d| d.document_id.as_str()).collect();

        for key in self.store.keys() {
            if live.contains(key.as_str()) {
                continue;
            }
            // Capture the value before deletion so the sink's delete
            // message can carry it.
            if let Some(preimage) = self.store.get(&key) {
                self.bridge.stage_preimage(&key, preimage);
            }
            self.store.remove_for_reconciliation(&key)?;
            log::info!(
                "Reconciliation removed phantom document '{}' from '{}'",
                key,
                self.store.collection()
            );
        }
        Ok(())
    }

    fn spawn_stream_loop(&self) {
        let store = self.store.clone();
        let client = self.client.clone();
        let bridge = self.bridge.clone();
        let checkpoints = self.checkpoints.clone();
        let versions = self.versions.clone();
        let config = self.config.clone();
        let mut stop_rx = self.stop.subscribe();
        let collection = store.collection().to_string();

        let handle = tokio::spawn(async move {
            // Session loop: one iteration per (re)subscribe
            loop {
                if *stop_rx.borrow() {
                    return;
                }

                // The checkpoint comes from durable storage on every
                // (re)connect; an in-memory value could rewind the stream
                // position after a missed save.
                let mut checkpoint = match checkpoints.load(&collection) {
                    Ok(cp) => cp,
                    Err(e) => {
                        log::error!("Failed to load checkpoint for '{}': {}", collection, e);
                        Checkpoint::default()
                    }
                };
                // The state vector accompanies the first request of the
                // session only.
                let mut vector = Some(store.state_vector());

                loop {
                    if *stop_rx.borrow() {
                        return;
                    }

                    let request = StreamRequest {
                        collection: collection.clone(),
                        checkpoint,
                        vector: vector.take(),
                        limit: Some(config.stream_limit),
                    };

                    let response = match client.stream(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            log::warn!(
                                "Stream subscription error for '{}', resubscribing: {}",
                                collection,
                                e
                            );
                            if wait_or_stop(&mut stop_rx, config.resubscribe_backoff).await {
                                return;
                            }
                            break;
                        }
                    };

                    if let Err(e) = apply_batch(&store, &bridge, &versions, &response.changes) {
                        log::error!("Failed to apply stream batch for '{}': {}", collection, e);
                        if wait_or_stop(&mut stop_rx, config.resubscribe_backoff).await {
                            return;
                        }
                        break;
                    }

                    checkpoint = response.checkpoint;
                    if let Err(e) = checkpoints.save(&collection, &checkpoint) {
                        log::warn!("Failed to save checkpoint for '{}': {}", collection, e);
                    }

                    if let Err(e) = store
                        .storage()
                        .compact(&collection, config.compact_keep_updates)
                    {
                        log::warn!("Local compaction failed for '{}': {}", collection, e);
                    }

                    if !response.has_more
                        && wait_or_stop(&mut stop_rx, config.poll_interval).await
                    {
                        return;
                    }
                }
            }
        });

        *self.task.lock().unwrap() = Some(handle);
    }

    /// Await startup completion. Replays the stored failure if
    /// initialization did not succeed.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, ReadyState::Pending))
            .await
            .map_err(|_| ReplicateError::Initialization("sync engine dropped".to_string()))?;

        match &*state {
            ReadyState::Ready => Ok(()),
            ReadyState::Failed(message) => Err(ReplicateError::Initialization(message.clone())),
            ReadyState::Pending => unreachable!("wait_for filtered Pending"),
        }
    }

    /// Cancel the stream subscription. Idempotent.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Sleep for `duration` unless stopped first. Returns true when stopped.
async fn wait_or_stop(stop_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *stop_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

fn seed_versions(versions: &Mutex<HashMap<String, i64>>, documents: &[MaterializedDocument]) {
    let mut versions = versions.lock().unwrap();
    for doc in documents {
        versions
            .entry(doc.document_id.clone())
            .and_modify(|v| *v = (*v).max(doc.version))
            .or_insert(doc.version);
    }
}

/// Apply one stream response in event order.
fn apply_batch(
    store: &CollectionStore,
    bridge: &ReactiveBridge,
    versions: &Mutex<HashMap<String, i64>>,
    changes: &[StreamEvent],
) -> Result<()> {
    for event in changes {
        match event.operation_type {
            OperationType::Snapshot => {
                store.apply_remote(&event.crdt_bytes, Origin::Snapshot)?;
                // The sink's incremental view predates the snapshot; reset
                // it and re-seed from the CRDT map.
                bridge.truncate_and_reseed(store);
            }
            OperationType::Diff | OperationType::Delta => {
                store.apply_remote(&event.crdt_bytes, Origin::Subscription)?;
            }
        }

        if let Some(document_id) = &event.document_id {
            let mut versions = versions.lock().unwrap();
            versions
                .entry(document_id.clone())
                .and_modify(|v| *v = (*v).max(event.version))
                .or_insert(event.version);
        }
    }
    Ok(())
}
