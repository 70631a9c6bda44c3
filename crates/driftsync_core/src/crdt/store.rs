//! Client-side CRDT store for one collection.
//!
//! This module provides [`CollectionStore`], which wraps a yrs [`Doc`]
//! holding the collection's documents as a keyed mapping of nested
//! sub-maps (one per record):
//!
//! ```text
//! Y.Doc
//! └── Y.Map "documents"
//!     ├── "t1" → Y.Map { id: "t1", text: "hi", done: false, ... }
//!     ├── "t2" → Y.Map { id: "t2", ... }
//!     └── ...
//! ```
//!
//! Local mutations run inside a transaction tagged with their origin and
//! capture exactly one delta covering only the keys touched; remote
//! updates are applied under their remote origin tag so the reactive
//! bridge can tell the two apart. Concurrent edits to different fields of
//! the same document merge field-wise; a delete concurrent with a field
//! update removes the document on both sides.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Map, MapRef, Out, ReadTxn, Transact, TransactionMut, Update};

use super::codec;
use super::types::{Delta, Origin};
use super::value;
use crate::error::{ReplicateError, Result};
use crate::storage::LocalStore;
use crate::sync::identity;

/// The name of the Y.Map holding the collection's documents.
pub(crate) const DOCUMENTS_MAP_NAME: &str = "documents";

/// A CRDT document store for one collection.
pub struct CollectionStore {
    collection: String,
    doc: Doc,
    documents: MapRef,
    storage: Arc<dyn LocalStore>,
    client_id: u64,
}

impl CollectionStore {
    /// Open the store for a collection, loading persisted state.
    ///
    /// The persisted snapshot and update log are merged into the fresh
    /// document through CRDT merge semantics, so state written by another
    /// process over the same storage is preserved rather than overwritten.
    /// The per-collection client identifier is reloaded (or generated on
    /// first use) so updates produced after a restart remain causally
    /// compatible with what the server already holds.
    pub fn open(storage: Arc<dyn LocalStore>, collection: &str) -> Result<Self> {
        let client_id = identity::load_or_create(storage.as_ref(), collection)?;
        let doc = codec::new_doc(collection, client_id);

        {
            let mut txn = doc.transact_mut();

            if let Some(state) = storage.load_doc(collection)? {
                let update = Update::decode_v2(&state).map_err(|e| {
                    ReplicateError::Codec(format!("Failed to decode persisted state: {}", e))
                })?;
                txn.apply_update(update).map_err(|e| {
                    ReplicateError::Codec(format!("Failed to apply persisted state: {}", e))
                })?;
            }

            // Replay the incremental log on top of the snapshot
            for stored in storage.updates(collection)? {
                if let Ok(update) = Update::decode_v2(&stored.data) {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!(
                            "Failed to apply stored update {} for {}: {}",
                            stored.update_id,
                            collection,
                            e
                        );
                    }
                }
            }
        }

        let documents = doc.get_or_insert_map(DOCUMENTS_MAP_NAME);

        Ok(Self {
            collection: collection.to_string(),
            doc,
            documents,
            storage,
            client_id,
        })
    }

    /// Get the underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Get the collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Get the stable client identifier for this (store, collection) pair.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<dyn LocalStore> {
        &self.storage
    }

    // ==================== Local Mutations ====================

    /// Insert a document, replacing any existing sub-map at `key`.
    ///
    /// Runs inside a transaction tagged `insert` and returns the captured
    /// delta together with the full post-transaction document.
    pub fn insert(&self, key: &str, record: &Value) -> Result<Delta> {
        if !record.is_object() {
            return Err(ReplicateError::InvalidDocument(
                "document must be a JSON object".to_string(),
            ));
        }

        let sv_before = self.state_vector_raw();
        codec::transact_with(&self.doc, Origin::Insert, |txn| {
            value::set_field(&self.documents, txn, key, record);
        });

        Ok(self.capture_delta(key, &sv_before, Origin::Insert))
    }

    /// Apply a field-level patch to an existing document.
    ///
    /// Runs inside a transaction tagged `update` and sets only the fields
    /// whose value changed. If the document does not exist the patch is
    /// dropped with an error log and an empty delta is returned.
    pub fn update(&self, key: &str, patch: &Value) -> Result<Delta> {
        let Some(patch_fields) = patch.as_object() else {
            return Err(ReplicateError::InvalidDocument(
                "patch must be a JSON object".to_string(),
            ));
        };

        let sv_before = self.state_vector_raw();
        let found = codec::transact_with(&self.doc, Origin::Update, |txn| {
            match self.documents.get(txn, key) {
                Some(Out::YMap(sub)) => {
                    value::merge_patch(&sub, txn, patch_fields);
                    true
                }
                _ => false,
            }
        });

        if !found {
            log::error!(
                "Update for unknown document '{}' in collection '{}', ignoring",
                key,
                self.collection
            );
            return Ok(Delta::empty());
        }

        Ok(self.capture_delta(key, &sv_before, Origin::Update))
    }

    /// Delete a document.
    ///
    /// Runs inside a transaction tagged `delete`; the CRDT retains a
    /// tombstone internally so the removal wins against concurrent field
    /// updates on the same key.
    pub fn delete(&self, key: &str) -> Result<Delta> {
        let sv_before = self.state_vector_raw();
        codec::transact_with(&self.doc, Origin::Delete, |txn| {
            self.documents.remove(txn, key);
        });

        Ok(self.capture_delta(key, &sv_before, Origin::Delete))
    }

    /// Remove a document the server's authoritative view no longer holds.
    ///
    /// Same removal as [`delete`](Self::delete) but tagged `reconciliation`
    /// so the reactive bridge treats it as a remote-origin change.
    pub fn remove_for_reconciliation(&self, key: &str) -> Result<()> {
        let sv_before = self.state_vector_raw();
        codec::transact_with(&self.doc, Origin::Reconciliation, |txn| {
            self.documents.remove(txn, key);
        });

        let delta = self.capture_delta(key, &sv_before, Origin::Reconciliation);
        debug_assert!(delta.document.is_none());
        Ok(())
    }

    /// Apply an update received from the server.
    ///
    /// `origin` must be one of the remote tags (`subscription`, `snapshot`,
    /// `ssr-init`); the applied bytes are persisted to the local log on a
    /// best-effort basis.
    pub fn apply_remote(&self, bytes: &[u8], origin: Origin) -> Result<()> {
        debug_assert!(origin.is_remote());
        codec::apply_update(&self.doc, bytes, origin)?;
        self.persist_update(bytes, origin);
        Ok(())
    }

    // ==================== Reads ====================

    /// Get a document as plain JSON.
    pub fn get(&self, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        self.documents
            .get(&txn, key)
            .map(|out| value::out_to_json(&txn, &out))
    }

    /// Whether a document exists.
    pub fn contains(&self, key: &str) -> bool {
        let txn = self.doc.transact();
        self.documents.get(&txn, key).is_some()
    }

    /// List all document keys.
    pub fn keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        self.documents.keys(&txn).map(|k| k.to_string()).collect()
    }

    /// The full document mapping, ordered by key.
    pub fn documents(&self) -> IndexMap<String, Value> {
        let txn = self.doc.transact();
        let mut entries: Vec<(String, Value)> = self
            .documents
            .iter(&txn)
            .map(|(key, out)| (key.to_string(), value::out_to_json(&txn, &out)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }

    /// Number of live documents.
    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.documents.len(&txn) as usize
    }

    /// Whether the collection has no live documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the document's state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        codec::state_vector(&self.doc)
    }

    /// Encode the full current state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        codec::encode_state(&self.doc)
    }

    // ==================== Observation & Persistence ====================

    /// Deep-observe the documents map.
    ///
    /// The callback fires after every committed transaction that touched
    /// the map or any nested sub-map, with the transaction origin intact.
    pub fn observe_deep<F>(&self, f: F) -> yrs::Subscription
    where
        F: Fn(&TransactionMut, &yrs::types::Events) + Send + Sync + 'static,
    {
        use yrs::DeepObservable;
        self.documents.observe_deep(f)
    }

    /// Read a document directly from an observer transaction.
    pub fn get_in<T: ReadTxn>(&self, txn: &T, key: &str) -> Option<Value> {
        self.documents
            .get(txn, key)
            .map(|out| value::out_to_json(txn, &out))
    }


    /// Save the full document state as the persisted snapshot.
    pub fn persist_snapshot(&self) -> Result<()> {
        self.storage
            .save_doc(&self.collection, &self.encode_state())
    }

    /// Capture the incremental update since `sv_before`, persist it, and
    /// package it with the full document at `key`.
    fn capture_delta(&self, key: &str, sv_before: &yrs::StateVector, origin: Origin) -> Delta {
        let (bytes, document) = {
            let txn = self.doc.transact();
            let bytes = txn.encode_state_as_update_v2(sv_before);
            let document = self
                .documents
                .get(&txn, key)
                .map(|out| value::out_to_json(&txn, &out));
            (bytes, document)
        };

        if !bytes.is_empty() {
            self.persist_update(&bytes, origin);
        }

        Delta { bytes, document }
    }

    /// Append an update to the local log. Durability here is best-effort
    /// and separate from the server round-trip.
    fn persist_update(&self, bytes: &[u8], origin: Origin) {
        if let Err(e) = self.storage.append_update(&self.collection, bytes, origin) {
            log::warn!(
                "Failed to persist {} update for collection '{}': {}",
                origin,
                self.collection,
                e
            );
        }
    }

    fn state_vector_raw(&self) -> yrs::StateVector {
        let txn = self.doc.transact();
        txn.state_vector()
    }
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("collection", &self.collection)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}
