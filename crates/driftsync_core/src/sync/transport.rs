//! Transport contract between the client engine and the server.
//!
//! [`ReplicateClient`] fixes the RPC surface; any concrete transport
//! (in-process, HTTP, ...) implements it. Wire types serialize with
//! camelCase field names and base64-encoded binary fields so the same
//! structs back both the in-process adapter and the JSON surface.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base64 (de)serialization for binary wire fields.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Base64 (de)serialization for optional binary wire fields.
pub mod base64_opt_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Boundary between consumed and un-consumed server events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Timestamp of the newest consumed event (milliseconds)
    pub last_modified: i64,
}

impl Checkpoint {
    pub fn new(last_modified: i64) -> Self {
        Self { last_modified }
    }
}

/// Kind of an event log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// Merged full collection state
    Snapshot,

    /// Coalesced diff against a client state vector
    Diff,

    /// Incremental update covering one transaction
    Delta,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Snapshot => write!(f, "snapshot"),
            OperationType::Diff => write!(f, "diff"),
            OperationType::Delta => write!(f, "delta"),
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(OperationType::Snapshot),
            "diff" => Ok(OperationType::Diff),
            "delta" => Ok(OperationType::Delta),
            _ => Err(format!("Unknown operation type: {}", s)),
        }
    }
}

/// One event from the server's delta stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Document the event belongs to; absent for collection-wide snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,

    /// Opaque UpdateV2 bytes
    #[serde(with = "base64_bytes")]
    pub crdt_bytes: Vec<u8>,

    /// Per-document version at the time of the event
    pub version: i64,

    /// Server timestamp (milliseconds), monotonic per collection
    pub timestamp: i64,

    /// Record kind
    pub operation_type: OperationType,
}

/// Arguments for the `stream` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub collection: String,

    pub checkpoint: Checkpoint,

    /// Client state vector; sent once per session (re)connect. Its
    /// presence tells the server to apply the backlog replay window and
    /// permits the coalesced-diff optimization.
    #[serde(default, with = "base64_opt_bytes", skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Response of the `stream` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    /// Events newer than the checkpoint, ascending by (timestamp, order)
    pub changes: Vec<StreamEvent>,

    /// Fresh checkpoint to persist after processing `changes`
    pub checkpoint: Checkpoint,

    /// Whether more events are immediately available
    pub has_more: bool,
}

/// A materialized document row as returned by the SSR query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedDocument {
    pub document_id: String,

    /// Full current document
    pub doc: serde_json::Value,

    pub version: i64,

    pub timestamp: i64,
}

/// Arguments for the SSR query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrRequest {
    pub collection: String,

    /// Also return the collection-wide CRDT state and its checkpoint
    #[serde(default)]
    pub include_crdt_state: bool,
}

/// Response of the SSR query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsrResponse {
    pub documents: Vec<MaterializedDocument>,

    pub count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,

    #[serde(default, with = "base64_opt_bytes", skip_serializing_if = "Option::is_none")]
    pub crdt_bytes: Option<Vec<u8>>,
}

/// Arguments for the `insertDocument` mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertDocumentRequest {
    pub collection: String,

    pub document_id: String,

    #[serde(with = "base64_bytes")]
    pub crdt_bytes: Vec<u8>,

    /// Full document to materialize
    pub materialized_doc: serde_json::Value,

    /// Initial version for the new row
    pub version: i64,

    #[serde(default, rename = "_schemaVersion", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

/// Arguments for the `updateDocument` mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDocumentRequest {
    pub collection: String,

    pub document_id: String,

    #[serde(with = "base64_bytes")]
    pub crdt_bytes: Vec<u8>,

    /// Full merged document after the client's local transaction (not a
    /// partial patch)
    pub materialized_doc: serde_json::Value,

    /// Expected current version; `None` skips the optimistic-concurrency
    /// check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, rename = "_schemaVersion", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

/// Arguments for the `deleteDocument` mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocumentRequest {
    pub collection: String,

    pub document_id: String,

    /// Deletion delta; retained in the event log after the row is removed
    #[serde(with = "base64_bytes")]
    pub crdt_bytes: Vec<u8>,

    /// Expected current version; `None` skips the optimistic-concurrency
    /// check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,

    #[serde(default, rename = "_schemaVersion", skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
}

/// Metadata describing an accepted mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationMetadata {
    pub document_id: String,

    pub timestamp: i64,

    pub version: i64,

    pub collection: String,
}

/// Result of a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub success: bool,

    /// True when identical bytes were already in the event log; the
    /// materialized row is untouched in that case
    #[serde(default)]
    pub deduplicated: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MutationMetadata>,
}

/// Response of the `getProtocolVersion` query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolVersionResponse {
    pub protocol_version: u32,
}

/// Retry classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 401/403; non-retriable, user-visible
    Auth,

    /// 422; non-retriable, user-visible
    Validation,

    /// Everything else; the offline queue may retry it later
    Retriable,
}

/// Wire error envelope of a failed server call.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{status}: {message}")]
pub struct TransportError {
    pub status: u16,
    pub message: String,
}

impl TransportError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A transport failure with no HTTP status (connection refused,
    /// offline, timeout); always retriable.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    pub fn class(&self) -> ErrorClass {
        match self.status {
            401 | 403 => ErrorClass::Auth,
            422 => ErrorClass::Validation,
            _ => ErrorClass::Retriable,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Retriable
    }
}

/// The server RPC surface consumed by the replication engine.
#[async_trait]
pub trait ReplicateClient: Send + Sync {
    async fn insert_document(
        &self,
        request: InsertDocumentRequest,
    ) -> Result<MutationResponse, TransportError>;

    async fn update_document(
        &self,
        request: UpdateDocumentRequest,
    ) -> Result<MutationResponse, TransportError>;

    async fn delete_document(
        &self,
        request: DeleteDocumentRequest,
    ) -> Result<MutationResponse, TransportError>;

    async fn stream(&self, request: StreamRequest) -> Result<StreamResponse, TransportError>;

    async fn ssr(&self, request: SsrRequest) -> Result<SsrResponse, TransportError>;

    async fn protocol_version(&self) -> Result<u32, TransportError>;
}
