//! In-memory storage implementation for testing and embedding.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{LocalStore, StorageResult};
use crate::crdt::codec;
use crate::crdt::types::{Origin, StoredUpdate};

/// Threshold for triggering auto-compaction (number of updates)
const AUTO_COMPACT_THRESHOLD: usize = 1000;

/// Number of updates to keep after auto-compaction
const AUTO_COMPACT_KEEP: usize = 500;

/// In-memory client storage.
///
/// All data lives in `HashMap`s behind `RwLock`s and is lost when the
/// store is dropped. Auto-compaction merges the oldest updates into the
/// document snapshot once a collection's log exceeds
/// [`AUTO_COMPACT_THRESHOLD`] entries, keeping the most recent
/// [`AUTO_COMPACT_KEEP`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Document snapshots (collection -> binary state)
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,

    /// Update logs (collection -> list of updates)
    updates: Arc<RwLock<HashMap<String, Vec<LoggedUpdate>>>>,

    /// Metadata keyspace
    meta: Arc<RwLock<HashMap<String, String>>>,

    /// Counter for generating update IDs
    next_id: Arc<RwLock<i64>>,
}

#[derive(Debug, Clone)]
struct LoggedUpdate {
    id: i64,
    data: Vec<u8>,
    timestamp: i64,
    origin: Origin,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }

    /// Merge the oldest updates of a collection into its snapshot.
    fn merge_into_snapshot(
        docs: &mut HashMap<String, Vec<u8>>,
        collection: &str,
        drained: Vec<LoggedUpdate>,
    ) -> StorageResult<()> {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(drained.len() + 1);
        if let Some(base) = docs.get(collection) {
            parts.push(base.clone());
        }
        parts.extend(drained.into_iter().map(|u| u.data));
        if parts.is_empty() {
            return Ok(());
        }
        let merged = codec::merge_updates(&parts)?;
        docs.insert(collection.to_string(), merged);
        Ok(())
    }
}

impl LocalStore for MemoryStore {
    fn load_doc(&self, collection: &str) -> StorageResult<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(collection).cloned())
    }

    fn save_doc(&self, collection: &str, state: &[u8]) -> StorageResult<()> {
        let mut docs = self.docs.write().unwrap();
        docs.insert(collection.to_string(), state.to_vec());
        Ok(())
    }

    fn append_update(&self, collection: &str, update: &[u8], origin: Origin) -> StorageResult<i64> {
        let id = self.next_update_id();
        let logged = LoggedUpdate {
            id,
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap();
        let log = updates.entry(collection.to_string()).or_default();
        log.push(logged);

        if log.len() > AUTO_COMPACT_THRESHOLD {
            let drained: Vec<LoggedUpdate> = log.drain(0..log.len() - AUTO_COMPACT_KEEP).collect();
            let mut docs = self.docs.write().unwrap();
            Self::merge_into_snapshot(&mut docs, collection, drained)?;
        }

        Ok(id)
    }

    fn updates(&self, collection: &str) -> StorageResult<Vec<StoredUpdate>> {
        let updates = self.updates.read().unwrap();
        let log = updates.get(collection).map(|u| u.as_slice()).unwrap_or(&[]);

        Ok(log
            .iter()
            .map(|u| StoredUpdate {
                update_id: u.id,
                collection: collection.to_string(),
                data: u.data.clone(),
                timestamp: u.timestamp,
                origin: u.origin,
            })
            .collect())
    }

    fn compact(&self, collection: &str, keep_updates: usize) -> StorageResult<()> {
        let mut updates = self.updates.write().unwrap();
        let Some(log) = updates.get_mut(collection) else {
            return Ok(());
        };
        if log.len() <= keep_updates {
            return Ok(());
        }

        let drained: Vec<LoggedUpdate> = log.drain(0..log.len() - keep_updates).collect();
        let mut docs = self.docs.write().unwrap();
        Self::merge_into_snapshot(&mut docs, collection, drained)
    }

    fn delete_collection(&self, collection: &str) -> StorageResult<()> {
        self.docs.write().unwrap().remove(collection);
        self.updates.write().unwrap().remove(collection);
        Ok(())
    }

    fn list_collections(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.keys().cloned().collect())
    }

    fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let meta = self.meta.read().unwrap();
        Ok(meta.get(key).cloned())
    }

    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut meta = self.meta.write().unwrap();
        meta.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_meta(&self, key: &str) -> StorageResult<()> {
        let mut meta = self.meta.write().unwrap();
        meta.remove(key);
        Ok(())
    }
}
