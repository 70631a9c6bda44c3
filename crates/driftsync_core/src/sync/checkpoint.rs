//! Durable per-collection stream checkpoints.
//!
//! The checkpoint marks the boundary between consumed and un-consumed
//! server events and is what lets the delta stream resume after a restart
//! or reconnect. Reconnect paths must load it from durable storage, never
//! from a cached in-memory value.

use std::sync::Arc;

use super::transport::Checkpoint;
use crate::storage::{LocalStore, StorageResult};

const CHECKPOINT_KEY_PREFIX: &str = "replicate:checkpoint:";

/// Durable `{collection -> Checkpoint}` store backed by the metadata
/// keyspace.
#[derive(Clone)]
pub struct CheckpointStore {
    storage: Arc<dyn LocalStore>,
}

impl CheckpointStore {
    pub fn new(storage: Arc<dyn LocalStore>) -> Self {
        Self { storage }
    }

    fn meta_key(collection: &str) -> String {
        format!("{}{}", CHECKPOINT_KEY_PREFIX, collection)
    }

    /// Load the checkpoint for a collection, defaulting to
    /// `{last_modified: 0}`.
    pub fn load(&self, collection: &str) -> StorageResult<Checkpoint> {
        let Some(raw) = self.storage.get_meta(&Self::meta_key(collection))? else {
            return Ok(Checkpoint::default());
        };

        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Ok(checkpoint),
            Err(e) => {
                log::warn!(
                    "Discarding unreadable checkpoint for collection '{}': {}",
                    collection,
                    e
                );
                Ok(Checkpoint::default())
            }
        }
    }

    /// Save a checkpoint. The stored value only ever advances; a stale
    /// checkpoint arriving late cannot rewind the stream position.
    pub fn save(&self, collection: &str, checkpoint: &Checkpoint) -> StorageResult<()> {
        let current = self.load(collection)?;
        if checkpoint.last_modified < current.last_modified {
            log::debug!(
                "Ignoring checkpoint rewind for collection '{}' ({} < {})",
                collection,
                checkpoint.last_modified,
                current.last_modified
            );
            return Ok(());
        }

        self.storage.put_meta(
            &Self::meta_key(collection),
            &serde_json::to_string(checkpoint)?,
        )
    }

    /// Remove the stored checkpoint; the next stream subscription starts
    /// from zero.
    pub fn clear(&self, collection: &str) -> StorageResult<()> {
        self.storage.remove_meta(&Self::meta_key(collection))
    }
}
