//! Bridge from the CRDT store to the external reactive sink.
//!
//! The bridge deep-observes the collection's documents map. For changes
//! applied under a remote origin (`subscription`, `snapshot`, `ssr-init`,
//! `reconciliation`) it emits one `begin()` / one write per changed
//! top-level key / `commit()` sequence into the sink. Local origins are
//! suppressed: the sink already applied those changes optimistically
//! through its own mutation path, and re-emitting them would loop.
//!
//! Events observed before a sink is attached are buffered and replayed
//! in order on attach, so nothing produced during initial load is lost.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use yrs::types::{EntryChange, Event, PathSegment};
use yrs::{Map, Out, ReadTxn, TransactionMut};

use crate::crdt::value::{any_to_json, map_to_json, out_to_json};
use crate::crdt::{CollectionStore, Origin};

/// A single write into the reactive sink.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteMessage {
    pub key: String,
    pub operation: WriteOperation,
}

/// Kind of sink write.
///
/// The bridge emits `Update` for keys it has not seen before as well,
/// because the sink has already observed optimistic inserts; `Insert` is
/// only used when re-seeding the sink after a collection-wide snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Insert(Value),
    Update(Value),
    Delete(Value),
}

/// The minimal contract of the external reactive collection.
pub trait ReactiveSink: Send + Sync {
    fn begin(&self);
    fn write(&self, message: WriteMessage);
    fn commit(&self);
    fn truncate(&self);
    fn mark_ready(&self);
}

/// Sink traffic produced while no sink was attached.
enum BufferedEvent {
    Batch(Vec<WriteMessage>),
    Truncate,
    MarkReady,
}

struct BridgeInner {
    sink: Option<Arc<dyn ReactiveSink>>,
    buffer: Vec<BufferedEvent>,
}

/// Observes a [`CollectionStore`] and forwards remote-origin changes to
/// the attached [`ReactiveSink`].
pub struct ReactiveBridge {
    inner: Mutex<BridgeInner>,

    /// Pre-images staged by the sync engine before reconciliation
    /// removals, keyed by document key.
    staged_preimages: Mutex<HashMap<String, Value>>,
}

impl ReactiveBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BridgeInner {
                sink: None,
                buffer: Vec::new(),
            }),
            staged_preimages: Mutex::new(HashMap::new()),
        })
    }

    /// Start observing a store. The returned subscription must be kept
    /// alive for the bridge to receive events.
    pub fn observe(self: &Arc<Self>, store: &CollectionStore) -> yrs::Subscription {
        let bridge: Weak<ReactiveBridge> = Arc::downgrade(self);

        store.observe_deep(move |txn, events| {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            let Some(origin) = Origin::from_yrs(txn.origin()) else {
                // Untagged transactions are internal (snapshot restore,
                // replay); nothing to forward.
                return;
            };
            if origin.is_local() {
                return;
            }

            let messages = collect_messages(txn, events, &bridge.staged_preimages);
            if !messages.is_empty() {
                bridge.emit(BufferedEvent::Batch(messages));
            }
        })
    }

    /// Attach the sink and replay anything buffered so far, in order.
    pub fn attach_sink(&self, sink: Arc<dyn ReactiveSink>) {
        let buffered = {
            let mut inner = self.inner.lock().unwrap();
            inner.sink = Some(sink.clone());
            std::mem::take(&mut inner.buffer)
        };

        for event in buffered {
            Self::deliver(sink.as_ref(), event);
        }
    }

    /// Stage the pre-image of a document about to be removed by
    /// reconciliation, so the sink's delete message can carry it.
    pub fn stage_preimage(&self, key: &str, value: Value) {
        self.staged_preimages
            .lock()
            .unwrap()
            .insert(key.to_string(), value);
    }

    /// Truncate the sink and re-emit an insert for every current key.
    ///
    /// Used after applying a collection-wide snapshot, when the sink's
    /// incremental view can no longer be trusted.
    pub fn truncate_and_reseed(&self, store: &CollectionStore) {
        self.emit(BufferedEvent::Truncate);

        let messages: Vec<WriteMessage> = store
            .documents()
            .into_iter()
            .map(|(key, value)| WriteMessage {
                key,
                operation: WriteOperation::Insert(value),
            })
            .collect();
        if !messages.is_empty() {
            self.emit(BufferedEvent::Batch(messages));
        }
    }

    /// Signal readiness to the sink (always called, even when sync
    /// initialization failed, to avoid indefinite loading states).
    pub fn mark_ready(&self) {
        self.emit(BufferedEvent::MarkReady);
    }

    fn emit(&self, event: BufferedEvent) {
        let sink = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.sink {
                Some(sink) => sink.clone(),
                None => {
                    inner.buffer.push(event);
                    return;
                }
            }
        };
        Self::deliver(sink.as_ref(), event);
    }

    fn deliver(sink: &dyn ReactiveSink, event: BufferedEvent) {
        match event {
            BufferedEvent::Batch(messages) => {
                sink.begin();
                for message in messages {
                    sink.write(message);
                }
                sink.commit();
            }
            BufferedEvent::Truncate => sink.truncate(),
            BufferedEvent::MarkReady => sink.mark_ready(),
        }
    }
}

/// Collect one write message per changed top-level key.
fn collect_messages(
    txn: &TransactionMut,
    events: &yrs::types::Events,
    staged: &Mutex<HashMap<String, Value>>,
) -> Vec<WriteMessage> {
    let Some(documents) = txn.get_map(crate::crdt::DOCUMENTS_MAP_NAME) else {
        return Vec::new();
    };
    let mut messages = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for event in events.iter() {
        // Documents and their fields are maps; nothing else is written.
        let Event::Map(map_event) = event else {
            continue;
        };

        let path = map_event.path();
        if let Some(PathSegment::Key(key)) = path.front() {
            // A change inside a document's sub-map: emit the current value
            // of that document once.
            let key = key.to_string();
            if seen.insert(key.clone()) {
                if let Some(out) = documents.get(txn, &key) {
                    messages.push(WriteMessage {
                        key,
                        operation: WriteOperation::Update(out_to_json(txn, &out)),
                    });
                }
            }
            continue;
        }

        // Root-level change on the documents map itself
        for (key, change) in map_event.keys(txn).iter() {
            let key = key.to_string();
            if !seen.insert(key.clone()) {
                continue;
            }

            match change {
                EntryChange::Inserted(_) | EntryChange::Updated(_, _) => {
                    if let Some(out) = documents.get(txn, &key) {
                        messages.push(WriteMessage {
                            key,
                            operation: WriteOperation::Update(out_to_json(txn, &out)),
                        });
                    }
                }
                EntryChange::Removed(old) => {
                    let staged_value = staged.lock().unwrap().remove(&key);
                    match staged_value.or_else(|| reconstruct_preimage(txn, old)) {
                        Some(preimage) => messages.push(WriteMessage {
                            key,
                            operation: WriteOperation::Delete(preimage),
                        }),
                        None => {
                            // Tombstoned content is gone; periodic
                            // reconciliation cleans the sink up instead.
                            log::debug!("No pre-image for deleted document '{}', skipping", key);
                        }
                    }
                }
            }
        }
    }

    messages
}

/// Try to reconstruct the pre-image of a removed document from the
/// observer's view of the old value.
fn reconstruct_preimage(txn: &TransactionMut, old: &Out) -> Option<Value> {
    match old {
        Out::Any(any) => Some(any_to_json(any)),
        Out::YMap(map) => {
            let value = map_to_json(txn, map);
            match value.as_object() {
                Some(fields) if !fields.is_empty() => Some(value),
                _ => None,
            }
        }
        _ => None,
    }
}
