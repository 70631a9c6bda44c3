//! DriftSync Server
//!
//! The authoritative store behind the DriftSync replication engine.
//!
//! ## Features
//!
//! - **Dual-storage mutations**: every insert/update/delete appends the
//!   opaque CRDT delta to an append-only event log and materializes the
//!   current document in the same SQL transaction
//! - **Checkpointed delta stream**: clients resume from a durable
//!   checkpoint, with a replay window tolerating out-of-order writes
//!   around reconnects and an optional coalesced diff-against-vector
//! - **SSR query**: materialized documents plus the collection-wide CRDT
//!   state for first render
//! - **Compaction & pruning**: old deltas fold into snapshot records on a
//!   schedule; superseded history is physically removed
//!
//! The server never parses CRDT bytes for conflict resolution; merging
//! happens on clients, the log just replays.
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3050)
//! - `DATABASE_PATH`: Path to SQLite database (default: ./driftsync.db)
//! - `BACKLOG_MS`: Stream replay window in ms (default: 300000)
//! - `COLLECTIONS`: Comma-separated collections for scheduled maintenance
//! - `COMPACTION_INTERVAL_HOURS`: Hours between compactions (default: 24)
//! - `COMPACTION_RETENTION_DAYS`: Compaction cutoff (default: 90)
//! - `PRUNING_INTERVAL_DAYS`: Days between prunes (default: 7)
//! - `PRUNING_RETENTION_DAYS`: Snapshot retention (default: 180)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod local;
pub mod migrate;
pub mod store;

pub use config::Config;
pub use error::{Result, ServerError};
pub use local::LocalClient;
pub use migrate::{MigrationStep, SchemaMigrations};
pub use store::{CompactionReport, PruneReport, ReplicateStore};
