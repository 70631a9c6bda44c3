//! Offline mutation queue.
//!
//! Failed mutations are queued with their creation time and attempt count
//! and replayed FIFO when connectivity returns. The queue persists itself
//! to the metadata keyspace so work queued before a crash survives the
//! restart; if that persistence itself fails the queue degrades to
//! online-only (memory-backed) mode and logs.
//!
//! The queue never parses CRDT bytes; it replays the exact transport
//! requests the mutation handlers built.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::transport::{
    DeleteDocumentRequest, ErrorClass, InsertDocumentRequest, MutationResponse, ReplicateClient,
    TransportError, UpdateDocumentRequest,
};
use crate::storage::LocalStore;

/// Queued mutations older than this are dropped on drain (24 hours).
const MAX_RETRY_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Queued mutations retried more than this are dropped on drain.
const MAX_RETRY_COUNT: u32 = 10;

const QUEUE_KEY_PREFIX: &str = "replicate:queue:";

/// A mutation request held for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueuedOp {
    Insert(InsertDocumentRequest),
    Update(UpdateDocumentRequest),
    Delete(DeleteDocumentRequest),
}

impl QueuedOp {
    /// The document the mutation targets.
    pub fn document_id(&self) -> &str {
        match self {
            QueuedOp::Insert(r) => &r.document_id,
            QueuedOp::Update(r) => &r.document_id,
            QueuedOp::Delete(r) => &r.document_id,
        }
    }

    /// Replay this mutation against a transport.
    pub async fn dispatch(
        &self,
        client: &dyn ReplicateClient,
    ) -> Result<MutationResponse, TransportError> {
        match self {
            QueuedOp::Insert(r) => client.insert_document(r.clone()).await,
            QueuedOp::Update(r) => client.update_document(r.clone()).await,
            QueuedOp::Delete(r) => client.delete_document(r.clone()).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// When the mutation first failed (milliseconds)
    pub created_at: i64,

    /// How many drains have already retried it
    pub retry_count: u32,

    pub op: QueuedOp,
}

/// Result of draining the queue on reconnect.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Mutations the server accepted
    pub applied: usize,

    /// Mutations dropped (expired, retry budget spent, or non-retriable)
    pub dropped: usize,

    /// Mutations re-queued after another retriable failure
    pub requeued: usize,
}

/// FIFO queue of mutations awaiting connectivity.
pub struct OfflineQueue {
    collection: String,
    storage: Arc<dyn LocalStore>,
    queue: Mutex<VecDeque<QueuedMutation>>,
    online_only: AtomicBool,
}

impl OfflineQueue {
    /// Load the persisted queue for a collection; an unreadable queue
    /// starts empty in online-only mode.
    pub fn load(storage: Arc<dyn LocalStore>, collection: &str) -> Self {
        let key = Self::meta_key(collection);
        let mut online_only = false;

        let queue = match storage.get_meta(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedMutation>>(&raw) {
                Ok(entries) => entries.into(),
                Err(e) => {
                    log::warn!(
                        "Discarding unreadable offline queue for '{}': {}",
                        collection,
                        e
                    );
                    VecDeque::new()
                }
            },
            Ok(None) => VecDeque::new(),
            Err(e) => {
                log::warn!(
                    "Offline queue storage unavailable for '{}', running online-only: {}",
                    collection,
                    e
                );
                online_only = true;
                VecDeque::new()
            }
        };

        Self {
            collection: collection.to_string(),
            storage,
            queue: Mutex::new(queue),
            online_only: AtomicBool::new(online_only),
        }
    }

    fn meta_key(collection: &str) -> String {
        format!("{}{}", QUEUE_KEY_PREFIX, collection)
    }

    /// Queue a failed mutation for later replay.
    pub fn enqueue(&self, op: QueuedOp) {
        let mutation = QueuedMutation {
            created_at: chrono::Utc::now().timestamp_millis(),
            retry_count: 0,
            op,
        };
        self.queue.lock().unwrap().push_back(mutation);
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether queue persistence has been disabled after a storage
    /// failure.
    pub fn is_online_only(&self) -> bool {
        self.online_only.load(Ordering::Relaxed)
    }

    /// Replay queued mutations FIFO.
    ///
    /// Entries older than 24 hours or past their retry budget are
    /// dropped. Non-retriable responses drop the entry; a retriable
    /// failure re-queues the entry (with its attempt count bumped) along
    /// with everything behind it, since the connection is evidently still
    /// bad.
    pub async fn drain(&self, client: &dyn ReplicateClient) -> DrainOutcome {
        let now = chrono::Utc::now().timestamp_millis();
        let pending: Vec<QueuedMutation> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).collect()
        };

        let mut outcome = DrainOutcome::default();
        let mut survivors: VecDeque<QueuedMutation> = VecDeque::new();
        let mut gave_up = false;

        for mut mutation in pending {
            if gave_up {
                survivors.push_back(mutation);
                continue;
            }

            if mutation.created_at <= now - MAX_RETRY_AGE_MS
                || mutation.retry_count >= MAX_RETRY_COUNT
            {
                log::info!(
                    "Dropping expired offline mutation for '{}' (document '{}')",
                    self.collection,
                    mutation.op.document_id()
                );
                outcome.dropped += 1;
                continue;
            }

            match mutation.op.dispatch(client).await {
                Ok(_) => outcome.applied += 1,
                Err(e) if e.class() == ErrorClass::Retriable => {
                    log::debug!(
                        "Offline replay for '{}' still failing ({}), keeping queue",
                        self.collection,
                        e
                    );
                    mutation.retry_count += 1;
                    survivors.push_back(mutation);
                    gave_up = true;
                }
                Err(e) => {
                    log::error!(
                        "Dropping non-retriable offline mutation for '{}' (document '{}'): {}",
                        self.collection,
                        mutation.op.document_id(),
                        e
                    );
                    outcome.dropped += 1;
                }
            }
        }

        outcome.requeued = survivors.len();
        {
            let mut queue = self.queue.lock().unwrap();
            // New mutations may have arrived while draining; keep them after
            // the survivors to preserve FIFO order.
            survivors.extend(queue.drain(..));
            *queue = survivors;
        }
        self.persist();

        outcome
    }

    /// Persist the queue; on failure degrade to online-only mode.
    fn persist(&self) {
        if self.online_only.load(Ordering::Relaxed) {
            return;
        }

        let serialized = {
            let queue = self.queue.lock().unwrap();
            serde_json::to_string(&queue.iter().collect::<Vec<_>>())
        };

        let result = serialized.map_err(|e| e.to_string()).and_then(|json| {
            self.storage
                .put_meta(&Self::meta_key(&self.collection), &json)
                .map_err(|e| e.to_string())
        });

        if let Err(e) = result {
            log::warn!(
                "Failed to persist offline queue for '{}', degrading to online-only: {}",
                self.collection,
                e
            );
            self.online_only.store(true, Ordering::Relaxed);
        }
    }
}
