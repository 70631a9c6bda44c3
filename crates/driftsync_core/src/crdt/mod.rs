//! CRDT codec, value conversions, and the client document store.

pub mod codec;
mod store;
pub(crate) mod types;
pub mod value;

pub(crate) use store::DOCUMENTS_MAP_NAME;
pub use store::CollectionStore;
pub use types::{Delta, Origin, StoredUpdate};
