//! Local persistence abstraction for the client replication engine.
//!
//! This module defines the [`LocalStore`] trait which abstracts over
//! durable client-side storage backends (SQLite, in-memory) for the CRDT
//! document bodies, the incremental update log, and the small metadata
//! keyspace (checkpoints, client identity, protocol version, offline
//! queue).

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::crdt::types::{Origin, StoredUpdate};
use crate::error::ReplicateError;

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, ReplicateError>;

/// Trait for client-side durable storage backends.
///
/// # Storage model
///
/// Each collection owns two pieces of CRDT data:
/// 1. **Document snapshot**: compacted full state of the collection's doc
/// 2. **Update log**: incremental updates appended since the snapshot
///
/// On startup the collection store loads the snapshot and replays the
/// update log through CRDT merge, so concurrent writers (e.g. multiple
/// tabs over the same store) converge on reload rather than overwrite
/// each other.
///
/// A separate key/value metadata space holds the per-collection sync
/// bookkeeping.
pub trait LocalStore: Send + Sync {
    /// Load the collection's document snapshot.
    ///
    /// Returns `None` if the collection has no persisted state.
    fn load_doc(&self, collection: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Save the collection's document snapshot, overwriting any existing one.
    fn save_doc(&self, collection: &str, state: &[u8]) -> StorageResult<()>;

    /// Append an incremental update to the collection's update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, collection: &str, update: &[u8], origin: Origin) -> StorageResult<i64>;

    /// Get all logged updates for a collection in append order.
    fn updates(&self, collection: &str) -> StorageResult<Vec<StoredUpdate>>;

    /// Merge old updates into the document snapshot, keeping only the most
    /// recent `keep_updates` entries in the log.
    fn compact(&self, collection: &str, keep_updates: usize) -> StorageResult<()>;

    /// Delete a collection's snapshot and update log.
    fn delete_collection(&self, collection: &str) -> StorageResult<()>;

    /// List all collections with persisted state.
    fn list_collections(&self) -> StorageResult<Vec<String>>;

    /// Read a metadata value.
    fn get_meta(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a metadata value.
    fn put_meta(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Remove a metadata value.
    fn remove_meta(&self, key: &str) -> StorageResult<()>;
}
