//! Full-state snapshots.
//!
//! A snapshot is the document's complete state encoded as a single CRDT
//! update. Two flavours exist on the wire:
//!
//! - [`SnapshotKind::Replaceable`]: relays keep the newest one per author
//!   and document; peers merge it as soon as it arrives.
//! - [`SnapshotKind::History`]: every save is kept; peers only list them and
//!   merge one on explicit request.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::event::SignedEvent;
use crate::protocol::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Replaceable,
    #[default]
    History,
}

impl SnapshotKind {
    pub const fn event_kind(self) -> EventKind {
        match self {
            Self::Replaceable => EventKind::ReplaceableSnapshot,
            Self::History => EventKind::SnapshotHistory,
        }
    }
}

/// Encodes the complete document state against an empty state vector.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    doc.transact().encode_state_as_update_v1(&StateVector::default())
}

/// Snapshots seen for one document, keyed by event id.
#[derive(Debug, Default, Clone)]
pub struct SnapshotCache {
    by_id: HashMap<String, SignedEvent>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a snapshot with the same id was already cached.
    pub fn insert(&mut self, event: SignedEvent) -> bool {
        if self.by_id.contains_key(&event.id) {
            return false;
        }
        self.by_id.insert(event.id.clone(), event);
        true
    }

    pub fn get(&self, id: &str) -> Option<&SignedEvent> {
        self.by_id.get(id)
    }

    /// All snapshots, newest first. Ties break on id for a stable order.
    pub fn list(&self) -> Vec<SignedEvent> {
        let mut snapshots: Vec<SignedEvent> = self.by_id.values().cloned().collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        snapshots
    }

    pub fn latest(&self, kind: SnapshotKind) -> Option<&SignedEvent> {
        self.by_id
            .values()
            .filter(|event| event.kind == kind.event_kind())
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| b.id.cmp(&a.id)))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;
    use crate::identity::Keys;
    use yrs::updates::decoder::Decode;
    use yrs::{GetString, Text, Update};

    fn snapshot(keys: &Keys, kind: SnapshotKind, at: u64, content: &str) -> SignedEvent {
        keys.sign(UnsignedEvent::new(kind.event_kind(), content, at).with_document("d"))
            .unwrap()
    }

    #[test]
    fn test_cache_dedups_by_id() {
        let keys = Keys::generate();
        let mut cache = SnapshotCache::new();
        let event = snapshot(&keys, SnapshotKind::History, 10, "a");
        assert!(cache.insert(event.clone()));
        assert!(!cache.insert(event.clone()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&event.id), Some(&event));
    }

    #[test]
    fn test_cache_lists_newest_first() {
        let keys = Keys::generate();
        let mut cache = SnapshotCache::new();
        cache.insert(snapshot(&keys, SnapshotKind::History, 10, "old"));
        cache.insert(snapshot(&keys, SnapshotKind::History, 30, "new"));
        cache.insert(snapshot(&keys, SnapshotKind::Replaceable, 20, "mid"));

        let list = cache.list();
        let times: Vec<u64> = list.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![30, 20, 10]);
        assert_eq!(cache.latest(SnapshotKind::History).unwrap().content, "new");
        assert_eq!(cache.latest(SnapshotKind::Replaceable).unwrap().content, "mid");
    }

    #[test]
    fn test_full_state_restores_document() {
        let source = Doc::new();
        let text = source.get_or_insert_text("body");
        text.insert(&mut source.transact_mut(), 0, "snapshot me");

        let state = encode_full_state(&source);
        let target = Doc::new();
        let restored = target.get_or_insert_text("body");
        target
            .transact_mut()
            .apply_update(Update::decode_v1(&state).unwrap())
            .unwrap();
        assert_eq!(restored.get_string(&target.transact()), "snapshot me");
    }

    #[test]
    fn test_kind_config_names() {
        let kind: SnapshotKind = serde_json::from_str(r#""replaceable""#).unwrap();
        assert_eq!(kind, SnapshotKind::Replaceable);
        assert_eq!(serde_json::to_string(&SnapshotKind::History).unwrap(), r#""history""#);
    }
}
