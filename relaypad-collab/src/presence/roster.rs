//! Pure roster bookkeeping. No I/O, no timers; time comes in as arguments.
//!
//! Rules applied to each incoming announcement, in order:
//!
//! | # | Rule | Effect |
//! |---|------|--------|
//! | 1 | older than the freshness window | ignored |
//! | 2 | carries the local client id | ignored |
//! | 3 | personal mode, same author as us, other client | that client evicted (a ghost of an earlier tab) |
//! | 4 | same stable identity as a different known client | older client evicted |
//! | 5 | state is null | client evicted |
//! | 6 | otherwise | inserted or updated; `last_seen` refreshed |
//!
//! The stable identity is the author's public key in personal mode, and
//! the display name at `state.user.name` in group mode (every group member
//! signs with the same key).

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::config::PresenceConfig;
use crate::identity::ParticipantMode;
use crate::payload::PresenceAnnouncement;

pub type ClientId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StableIdentity {
    PublicKey(String),
    DisplayName(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub client_id: ClientId,
    pub state: Value,
    pub public_key: String,
    pub last_seen_ms: u64,
}

/// Client ids touched by one roster operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl RosterChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: RosterChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

/// Extracts `state.user.name`.
pub fn display_name(state: &Value) -> Option<&str> {
    state.get("user")?.get("name")?.as_str()
}

#[derive(Debug, Clone)]
pub struct Roster {
    local_client_id: ClientId,
    local_public_key: String,
    mode: ParticipantMode,
    freshness_ms: u64,
    stale_after_ms: u64,
    entries: HashMap<ClientId, RosterEntry>,
    identities: HashMap<StableIdentity, ClientId>,
}

impl Roster {
    pub fn new(
        local_client_id: ClientId,
        local_public_key: impl Into<String>,
        mode: ParticipantMode,
        config: &PresenceConfig,
    ) -> Self {
        Self {
            local_client_id,
            local_public_key: local_public_key.into(),
            mode,
            freshness_ms: config.freshness_secs * 1000,
            stale_after_ms: config.stale_secs * 1000,
            entries: HashMap::new(),
            identities: HashMap::new(),
        }
    }

    /// Applies one announcement authored by `author` at `created_at`
    /// (seconds), as observed at `now_ms`.
    pub fn apply(
        &mut self,
        author: &str,
        created_at: u64,
        announcement: &PresenceAnnouncement,
        now_ms: u64,
    ) -> RosterChange {
        let mut change = RosterChange::default();
        let client_id = announcement.client_id;

        if created_at.saturating_mul(1000).saturating_add(self.freshness_ms) < now_ms {
            log::debug!("Ignoring stale presence from client {client_id}");
            return change;
        }
        if client_id == self.local_client_id {
            return change;
        }
        if self.mode == ParticipantMode::Personal && author == self.local_public_key {
            // Our own key on another client id: an earlier session of ours.
            if self.evict(client_id) {
                change.removed.push(client_id);
            }
            return change;
        }

        let identity = match (self.mode, &announcement.state) {
            (ParticipantMode::Personal, _) => Some(StableIdentity::PublicKey(author.to_string())),
            (ParticipantMode::Group, Some(state)) => {
                display_name(state).map(|name| StableIdentity::DisplayName(name.to_string()))
            }
            (ParticipantMode::Group, None) => None,
        };
        if let Some(identity) = identity {
            if let Some(previous) = self.identities.insert(identity, client_id) {
                if previous != client_id && self.evict(previous) {
                    log::debug!("Client {client_id} replaces ghost {previous}");
                    change.removed.push(previous);
                }
            }
        }

        match &announcement.state {
            None => {
                if self.evict(client_id) {
                    change.removed.push(client_id);
                }
            }
            Some(state) => match self.entries.get_mut(&client_id) {
                Some(entry) => {
                    entry.last_seen_ms = now_ms;
                    entry.public_key = author.to_string();
                    if entry.state != *state {
                        entry.state = state.clone();
                        change.updated.push(client_id);
                    }
                }
                None => {
                    self.entries.insert(
                        client_id,
                        RosterEntry {
                            client_id,
                            state: state.clone(),
                            public_key: author.to_string(),
                            last_seen_ms: now_ms,
                        },
                    );
                    change.added.push(client_id);
                }
            },
        }
        change
    }

    /// Evicts every entry not refreshed within the staleness window.
    pub fn sweep(&mut self, now_ms: u64) -> RosterChange {
        let stale: Vec<ClientId> = self
            .entries
            .values()
            .filter(|entry| now_ms.saturating_sub(entry.last_seen_ms) > self.stale_after_ms)
            .map(|entry| entry.client_id)
            .collect();

        let mut change = RosterChange::default();
        for client_id in stale {
            if self.evict(client_id) {
                log::debug!("Client {client_id} timed out");
                change.removed.push(client_id);
            }
        }
        change
    }

    pub fn remove(&mut self, client_id: ClientId) -> bool {
        self.evict(client_id)
    }

    fn evict(&mut self, client_id: ClientId) -> bool {
        self.identities.retain(|_, id| *id != client_id);
        self.entries.remove(&client_id).is_some()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&RosterEntry> {
        self.entries.get(&client_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RosterEntry> {
        self.entries.values()
    }

    /// Remote states keyed by client id.
    pub fn states(&self) -> BTreeMap<ClientId, Value> {
        self.entries
            .values()
            .map(|entry| (entry.client_id, entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW_SECS: u64 = 1_700_000_000;
    const NOW_MS: u64 = NOW_SECS * 1000;
    const ME: &str = "my-key";

    fn roster(mode: ParticipantMode) -> Roster {
        Roster::new(1, ME, mode, &PresenceConfig::default())
    }

    fn announce(client_id: ClientId, state: Option<Value>) -> PresenceAnnouncement {
        PresenceAnnouncement { client_id, state, ts: NOW_SECS }
    }

    fn user(name: &str) -> Option<Value> {
        Some(json!({"user": {"name": name, "color": "#ABCDEF"}}))
    }

    #[test]
    fn test_add_then_update() {
        let mut roster = roster(ParticipantMode::Personal);
        let change = roster.apply("alice", NOW_SECS, &announce(2, user("alice")), NOW_MS);
        assert_eq!(change.added, vec![2]);

        let same = roster.apply("alice", NOW_SECS, &announce(2, user("alice")), NOW_MS + 5);
        assert!(same.is_empty());
        assert_eq!(roster.get(2).unwrap().last_seen_ms, NOW_MS + 5);

        let moved = roster.apply(
            "alice",
            NOW_SECS,
            &announce(2, Some(json!({"user": {"name": "alice"}, "cursor": 4}))),
            NOW_MS,
        );
        assert_eq!(moved.updated, vec![2]);
        assert_eq!(roster.states()[&2]["cursor"], 4);
    }

    #[test]
    fn test_ghost_replaced_by_new_client() {
        let mut roster = roster(ParticipantMode::Personal);
        roster.apply("alice", NOW_SECS, &announce(2, user("a")), NOW_MS);
        let change = roster.apply("alice", NOW_SECS, &announce(3, user("a2")), NOW_MS);

        assert_eq!(change.removed, vec![2]);
        assert_eq!(change.added, vec![3]);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.states()[&3], user("a2").unwrap());
    }

    #[test]
    fn test_stale_announcement_ignored() {
        let mut roster = roster(ParticipantMode::Personal);
        let change = roster.apply("bob", NOW_SECS - 31, &announce(2, user("bob")), NOW_MS);
        assert!(change.is_empty());
        assert!(roster.is_empty());

        let fresh = roster.apply("bob", NOW_SECS - 30, &announce(2, user("bob")), NOW_MS);
        assert_eq!(fresh.added, vec![2]);
    }

    #[test]
    fn test_self_announcements_suppressed() {
        let mut roster = roster(ParticipantMode::Personal);
        assert!(roster.apply("bob", NOW_SECS, &announce(1, user("me?")), NOW_MS).is_empty());
        assert!(roster.is_empty());
    }

    #[test]
    fn test_own_key_other_client_evicted() {
        let mut roster = roster(ParticipantMode::Personal);
        // Somehow a client under our key got in (e.g. group mode switched off).
        roster.entries.insert(
            9,
            RosterEntry { client_id: 9, state: json!({}), public_key: ME.into(), last_seen_ms: NOW_MS },
        );
        let change = roster.apply(ME, NOW_SECS, &announce(9, user("old tab")), NOW_MS);
        assert_eq!(change.removed, vec![9]);

        let ignored = roster.apply(ME, NOW_SECS, &announce(10, user("other tab")), NOW_MS);
        assert!(ignored.is_empty());
        assert!(roster.is_empty());
    }

    #[test]
    fn test_null_state_evicts() {
        let mut roster = roster(ParticipantMode::Personal);
        roster.apply("carol", NOW_SECS, &announce(4, user("carol")), NOW_MS);
        let change = roster.apply("carol", NOW_SECS, &announce(4, None), NOW_MS);
        assert_eq!(change.removed, vec![4]);
        assert!(roster.is_empty());

        // Offline for an unknown client changes nothing.
        assert!(roster.apply("dave", NOW_SECS, &announce(5, None), NOW_MS).is_empty());
    }

    #[test]
    fn test_group_mode_disambiguates_by_name() {
        let mut roster = roster(ParticipantMode::Group);
        // Same key as ours is normal in group mode.
        let a = roster.apply(ME, NOW_SECS, &announce(2, user("ann")), NOW_MS);
        let b = roster.apply(ME, NOW_SECS, &announce(3, user("ben")), NOW_MS);
        assert_eq!((a.added, b.added), (vec![2], vec![3]));
        assert_eq!(roster.len(), 2);

        // Ann reloads: new client id, same name.
        let reload = roster.apply(ME, NOW_SECS, &announce(4, user("ann")), NOW_MS);
        assert_eq!(reload.removed, vec![2]);
        assert_eq!(reload.added, vec![4]);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_group_mode_without_name_never_collides() {
        let mut roster = roster(ParticipantMode::Group);
        roster.apply(ME, NOW_SECS, &announce(2, Some(json!({"cursor": 1}))), NOW_MS);
        roster.apply(ME, NOW_SECS, &announce(3, Some(json!({"cursor": 2}))), NOW_MS);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_sweep_evicts_after_stale_window() {
        let mut roster = roster(ParticipantMode::Personal);
        roster.apply("erin", NOW_SECS, &announce(6, user("erin")), NOW_MS);
        assert!(roster.sweep(NOW_MS + 40_000).is_empty());

        let change = roster.sweep(NOW_MS + 41_000);
        assert_eq!(change.removed, vec![6]);
        assert!(roster.is_empty());

        // The identity slot is free again.
        let back = roster.apply("erin", NOW_SECS + 41, &announce(7, user("erin")), NOW_MS + 41_000);
        assert_eq!(back.added, vec![7]);
        assert!(back.removed.is_empty());
    }

    #[test]
    fn test_change_merge() {
        let mut total = RosterChange { added: vec![1], ..Default::default() };
        total.merge(RosterChange { removed: vec![2], ..Default::default() });
        assert_eq!(total.added, vec![1]);
        assert_eq!(total.removed, vec![2]);
        assert!(!total.is_empty());
    }
}
