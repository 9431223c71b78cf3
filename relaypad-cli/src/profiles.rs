//! Profile names for roster entries that announce none themselves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaypad_collab::{display_name, fetch_profile, RosterEntry, Transport};

/// Caches profile lookups by public key, misses included.
pub struct ProfileNames {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    names: HashMap<String, Option<String>>,
}

impl ProfileNames {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            names: HashMap::new(),
        }
    }

    /// Looks up every public key in `entries` not seen before.
    ///
    /// Entries whose presence state already carries a name are skipped.
    pub async fn resolve(&mut self, entries: &[RosterEntry]) {
        for entry in entries {
            if display_name(&entry.state).is_some() || self.names.contains_key(&entry.public_key) {
                continue;
            }
            let profile =
                fetch_profile(self.transport.as_ref(), &entry.public_key, self.timeout).await;
            let name = profile.and_then(|profile| profile.name);
            if let Some(name) = &name {
                log::debug!("Profile name {name} for {}", entry.public_key);
            }
            self.names.insert(entry.public_key.clone(), name);
        }
    }

    pub fn get(&self, public_key: &str) -> Option<&str> {
        self.names.get(public_key)?.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaypad_collab::{ClientId, EventKind, Keys, MemoryHub, UnsignedEvent};
    use serde_json::json;

    fn entry(client_id: ClientId, state: serde_json::Value, public_key: &str) -> RosterEntry {
        RosterEntry {
            client_id,
            state,
            public_key: public_key.into(),
            last_seen_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_resolves_names_from_profiles() {
        let hub = Arc::new(MemoryHub::new());
        let ada = Keys::generate();
        hub.inject(
            ada.sign(UnsignedEvent::new(EventKind::Metadata, r#"{"name":"ada"}"#, 1_700_000_000))
                .unwrap(),
        );
        let anonymous = Keys::generate();

        let mut names = ProfileNames::new(hub.clone(), Duration::from_millis(200));
        let entries = vec![
            entry(1, json!({"cursor": 0}), ada.public_key()),
            entry(2, json!({}), anonymous.public_key()),
            entry(3, json!({"user": {"name": "bob"}}), "not-looked-up"),
        ];
        tokio::time::timeout(Duration::from_secs(5), names.resolve(&entries))
            .await
            .unwrap();

        assert_eq!(names.get(ada.public_key()), Some("ada"));
        assert_eq!(names.get(anonymous.public_key()), None);
        assert!(names.names.contains_key(anonymous.public_key()));
        assert!(!names.names.contains_key("not-looked-up"));
    }
}
