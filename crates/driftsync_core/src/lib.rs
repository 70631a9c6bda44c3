//! DriftSync core: a local-first replication engine.
//!
//! Synchronizes a client-side ordered mapping of JSON-like documents (a
//! "collection") with a server-side authoritative store, using
//! Yjs-compatible UpdateV2 CRDT updates as the wire and
//! conflict-resolution mechanism. Concurrent edits from multiple clients
//! converge deterministically without manual conflict handlers.
//!
//! ## Architecture
//!
//! - [`crdt`] — the UpdateV2 codec and the per-collection CRDT document
//!   store (keyed mapping of nested sub-maps, one per record)
//! - [`storage`] — durable client persistence: document snapshots, the
//!   incremental update log, and sync metadata (SQLite or in-memory)
//! - [`sync`] — checkpointed delta-stream engine, protocol gate, reactive
//!   bridge, and offline mutation queue
//! - [`collection`] — the [`Collection`] handle tying the layers together
//!
//! ## Example
//!
//! ```ignore
//! use driftsync_core::{Collection, CollectionOptions, SqliteStore};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(SqliteStore::open("replicate.db")?);
//! let tasks = Collection::open(
//!     storage,
//!     server_client,
//!     reactive_sink,
//!     CollectionOptions::new("tasks"),
//!     None,
//! )
//! .await?;
//!
//! tasks.insert("t1", serde_json::json!({ "id": "t1", "text": "hi" })).await?;
//! ```

/// Replicated collection handle - the main entry point
pub mod collection;

/// CRDT codec and client document store
pub mod crdt;

/// Error (common error types)
pub mod error;

/// Durable client-side storage backends
pub mod storage;

/// Sync engine, protocol gate, reactive bridge, offline queue
pub mod sync;

pub use collection::{Collection, CollectionOptions, MutationOutcome};
pub use crdt::{CollectionStore, Delta, Origin};
pub use error::{ReplicateError, Result};
pub use storage::{LocalStore, MemoryStore, SqliteStore, StorageResult};
pub use sync::bridge::{ReactiveBridge, ReactiveSink, WriteMessage, WriteOperation};
pub use sync::checkpoint::CheckpointStore;
pub use sync::engine::{SsrPayload, SyncConfig, SyncEngine};
pub use sync::protocol::{PROTOCOL_VERSION, ProtocolGate};
pub use sync::retry::{DrainOutcome, OfflineQueue, QueuedOp};
pub use sync::transport::{
    Checkpoint, DeleteDocumentRequest, ErrorClass, InsertDocumentRequest, MaterializedDocument,
    MutationMetadata, MutationResponse, OperationType, ProtocolVersionResponse, ReplicateClient,
    SsrRequest, SsrResponse, StreamEvent, StreamRequest, StreamResponse, TransportError,
    UpdateDocumentRequest,
};
