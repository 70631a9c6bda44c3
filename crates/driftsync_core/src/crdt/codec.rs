//! Opaque CRDT codec over yrs documents.
//!
//! All update bytes handled by the replication engine are Yjs-compatible
//! UpdateV2 sequences; state vectors use the standard Yjs encoding. The
//! codec guarantees commutative, associative, idempotent merging of
//! updates: equal state vectors imply equal observable state.
//!
//! A snapshot is simply the full document state encoded as a single
//! update, so restoring one into an empty document is a plain apply and
//! merging two snapshots is equivalent to applying one then the other.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, TransactionMut, Update};

use super::types::Origin;
use crate::error::{ReplicateError, Result};

/// Create an empty document with an explicit client identifier.
///
/// The client identifier must be stable across restarts of the same
/// client so that updates produced after a reload remain causally
/// compatible with what the server already holds.
pub fn new_doc(guid: &str, client_id: u64) -> Doc {
    let mut options = Options::with_client_id(client_id);
    options.guid = guid.to_string().into();
    Doc::with_options(options)
}

/// Apply an UpdateV2 to a document inside a transaction tagged with the
/// given origin. Observers receive the origin verbatim.
pub fn apply_update(doc: &Doc, bytes: &[u8], origin: Origin) -> Result<()> {
    let update = Update::decode_v2(bytes)
        .map_err(|e| ReplicateError::Codec(format!("Failed to decode update: {}", e)))?;
    let mut txn = doc.transact_mut_with(origin);
    txn.apply_update(update)
        .map_err(|e| ReplicateError::Codec(format!("Failed to apply update: {}", e)))?;
    Ok(())
}

/// Encode the full current state as a single UpdateV2.
pub fn encode_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v2(&StateVector::default())
}

/// Encode the difference between the document and a remote state vector
/// as a standalone UpdateV2.
pub fn encode_diff(doc: &Doc, vector: &[u8]) -> Result<Vec<u8>> {
    let sv = StateVector::decode_v1(vector)
        .map_err(|e| ReplicateError::Codec(format!("Failed to decode state vector: {}", e)))?;
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v2(&sv))
}

/// Encode the document's state vector.
pub fn state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Merge a batch of updates into a single UpdateV2.
pub fn merge_updates(updates: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut decoded = Vec::with_capacity(updates.len());
    for bytes in updates {
        decoded.push(
            Update::decode_v2(bytes)
                .map_err(|e| ReplicateError::Codec(format!("Failed to decode update: {}", e)))?,
        );
    }
    Ok(Update::merge_updates(decoded).encode_v2())
}

/// Encode the full current state as a restorable snapshot.
pub fn encode_snapshot(doc: &Doc) -> Vec<u8> {
    encode_state(doc)
}

/// Restore a snapshot into a document.
pub fn restore_snapshot(target: &Doc, snapshot: &[u8]) -> Result<()> {
    let update = Update::decode_v2(snapshot)
        .map_err(|e| ReplicateError::Codec(format!("Failed to decode snapshot: {}", e)))?;
    let mut txn = target.transact_mut();
    txn.apply_update(update)
        .map_err(|e| ReplicateError::Codec(format!("Failed to apply snapshot: {}", e)))?;
    Ok(())
}

/// Run a closure inside a single transaction tagged with the given
/// origin; all writes commit as one update.
pub fn transact_with<F, T>(doc: &Doc, origin: Origin, f: F) -> T
where
    F: FnOnce(&mut TransactionMut) -> T,
{
    let mut txn = doc.transact_mut_with(origin);
    f(&mut txn)
}
