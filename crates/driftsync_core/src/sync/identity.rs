//! Stable per-collection client identity.
//!
//! Yjs causality requires that a client reuses the same numeric client id
//! across restarts; otherwise updates produced after a reload would fork
//! the causal history the server already holds.

use rand::Rng;

use crate::storage::{LocalStore, StorageResult};

const CLIENT_ID_KEY_PREFIX: &str = "yjsClientId:";

/// Metadata key under which a collection's client id is persisted.
pub fn meta_key(collection: &str) -> String {
    format!("{}{}", CLIENT_ID_KEY_PREFIX, collection)
}

/// Load the persisted client identifier for a collection, generating and
/// persisting a fresh one uniformly in `[1, 2^31 - 1]` if absent.
pub fn load_or_create(storage: &dyn LocalStore, collection: &str) -> StorageResult<u64> {
    let key = meta_key(collection);

    if let Some(raw) = storage.get_meta(&key)? {
        match raw.parse::<u64>() {
            Ok(id) if (1..=i32::MAX as u64).contains(&id) => return Ok(id),
            _ => log::warn!(
                "Discarding invalid stored client id '{}' for collection '{}'",
                raw,
                collection
            ),
        }
    }

    let id = rand::thread_rng().gen_range(1..=i32::MAX as u64);
    storage.put_meta(&key, &id.to_string())?;
    Ok(id)
}
