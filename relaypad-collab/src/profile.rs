//! Profile metadata (kind 0) lookups and identity colours.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::protocol::{EventKind, Filter};
use crate::transport::{InboundEvent, Transport};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
}

/// Requests the newest profile event of `public_key`.
///
/// Returns `None` when nothing parseable arrives before `timeout`.
/// Malformed profile contents are skipped, not fatal.
pub async fn fetch_profile(
    transport: &dyn Transport,
    public_key: &str,
    timeout: Duration,
) -> Option<Profile> {
    let filter = Filter::new()
        .kinds([EventKind::Metadata])
        .author(public_key)
        .limit(1);
    let (sink, mut inbound) = mpsc::unbounded_channel();
    let subscription = match transport.subscribe(filter, sink) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Profile lookup for {public_key} failed: {e}");
            return None;
        }
    };

    let lookup = async {
        while let Some(message) = inbound.recv().await {
            let InboundEvent::Event { event, .. } = message else {
                continue;
            };
            if event.pubkey != public_key {
                continue;
            }
            match serde_json::from_str::<Profile>(&event.content) {
                Ok(profile) => return Some(profile),
                Err(e) => log::debug!("Skipping malformed profile {}: {e}", event.id),
            }
        }
        None
    };
    let profile = tokio::time::timeout(timeout, lookup).await.ok().flatten();

    transport.unsubscribe(&subscription);
    if profile.is_none() {
        log::debug!("No profile found for {public_key}");
    }
    profile
}

/// Stable `#RRGGBB` colour for an identity string.
pub fn color_for(key: &str) -> String {
    let hash = key
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            i32::from(unit).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash))
        });
    format!("#{:06X}", (hash as u32) & 0x00ff_ffff)
}
