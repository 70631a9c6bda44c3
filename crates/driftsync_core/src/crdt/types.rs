//! Core types for CRDT-based replication.
//!
//! This module defines the transaction origin tags and the update records
//! shared between the client store, the local persistence layer, and the
//! sync engine.

use serde::{Deserialize, Serialize};

/// Origin of a CRDT transaction.
///
/// Origins form a closed set so the reactive bridge can deterministically
/// decide whether an observed change must be re-emitted to the external
/// sink: local origins were already applied optimistically through the
/// sink's own mutation path, remote origins were not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Local insert mutation
    Insert,

    /// Local field-level update mutation
    Update,

    /// Local delete mutation
    Delete,

    /// Update received from the server delta stream
    Subscription,

    /// Collection-wide snapshot received from the server
    Snapshot,

    /// Initial CRDT state supplied by server-side rendering
    SsrInit,

    /// Local removal of a document the server no longer knows
    Reconciliation,
}

impl Origin {
    /// Whether this origin denotes a local user mutation.
    ///
    /// Only deltas produced under a local origin are queued for the server;
    /// remote-origin updates are never re-sent.
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Insert | Origin::Update | Origin::Delete)
    }

    /// Whether this origin denotes a change received from the server side.
    pub fn is_remote(&self) -> bool {
        !self.is_local()
    }

    /// Stable string form, also used as the yrs transaction origin tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Insert => "insert",
            Origin::Update => "update",
            Origin::Delete => "delete",
            Origin::Subscription => "subscription",
            Origin::Snapshot => "snapshot",
            Origin::SsrInit => "ssr-init",
            Origin::Reconciliation => "reconciliation",
        }
    }

    /// Parse an origin back from a yrs transaction origin, if it carries one
    /// of our tags.
    pub fn from_yrs(origin: Option<&yrs::Origin>) -> Option<Origin> {
        let bytes = origin?.as_ref();
        std::str::from_utf8(bytes).ok()?.parse().ok()
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Origin::Insert),
            "update" => Ok(Origin::Update),
            "delete" => Ok(Origin::Delete),
            "subscription" => Ok(Origin::Subscription),
            "snapshot" => Ok(Origin::Snapshot),
            "ssr-init" => Ok(Origin::SsrInit),
            "reconciliation" => Ok(Origin::Reconciliation),
            _ => Err(format!("Unknown origin: {}", s)),
        }
    }
}

impl From<Origin> for yrs::Origin {
    fn from(origin: Origin) -> Self {
        yrs::Origin::from(origin.as_str())
    }
}

/// A delta captured from a local transaction.
///
/// `bytes` is the incremental UpdateV2 covering exactly the keys touched in
/// the transaction. `document` is the full post-transaction document for the
/// touched key (mutation handlers submit the merged document to the server,
/// not a partial patch); it is `None` for deletions and no-op updates.
#[derive(Debug, Clone)]
pub struct Delta {
    /// Incremental UpdateV2 bytes
    pub bytes: Vec<u8>,

    /// Full merged document after the transaction, if one remains
    pub document: Option<serde_json::Value>,
}

impl Delta {
    /// A delta that carries no change (e.g. update of a missing key).
    pub fn empty() -> Self {
        Self {
            bytes: Vec::new(),
            document: None,
        }
    }

    /// Whether this delta carries no change.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// An update record in the local persistence log.
#[derive(Debug, Clone)]
pub struct StoredUpdate {
    /// Unique identifier for this update
    pub update_id: i64,

    /// Collection this update belongs to
    pub collection: String,

    /// Binary UpdateV2 data
    pub data: Vec<u8>,

    /// Unix timestamp when this update was recorded (milliseconds)
    pub timestamp: i64,

    /// Origin of this update
    pub origin: Origin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_locality() {
        assert!(Origin::Insert.is_local());
        assert!(Origin::Update.is_local());
        assert!(Origin::Delete.is_local());
        assert!(Origin::Subscription.is_remote());
        assert!(Origin::Snapshot.is_remote());
        assert!(Origin::SsrInit.is_remote());
        assert!(Origin::Reconciliation.is_remote());
    }

    #[test]
    fn test_origin_round_trip() {
        let all = [
            Origin::Insert,
            Origin::Update,
            Origin::Delete,
            Origin::Subscription,
            Origin::Snapshot,
            Origin::SsrInit,
            Origin::Reconciliation,
        ];
        for origin in all {
            assert_eq!(origin.as_str().parse::<Origin>().unwrap(), origin);
        }
        assert!("invalid".parse::<Origin>().is_err());
    }

    #[test]
    fn test_origin_from_yrs() {
        let yrs_origin = yrs::Origin::from("ssr-init");
        assert_eq!(Origin::from_yrs(Some(&yrs_origin)), Some(Origin::SsrInit));

        let unknown = yrs::Origin::from("something-else");
        assert_eq!(Origin::from_yrs(Some(&unknown)), None);
        assert_eq!(Origin::from_yrs(None), None);
    }

    #[test]
    fn test_delta_empty() {
        let delta = Delta::empty();
        assert!(delta.is_empty());
        assert!(delta.document.is_none());
    }
}
