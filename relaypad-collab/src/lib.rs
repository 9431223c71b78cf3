//! # relaypad-collab — Real-time collaboration over Nostr relays
//!
//! Replicates CRDT documents and presence through untrusted relays. There is
//! no collaboration server: every client holds a replica, publishes signed
//! updates and merges whatever the relays hand back, in any order and with
//! any amount of duplication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── DocumentSession ────────────────────────┐
//! │  ┌─────────────────┐                    ┌──────────────────┐    │
//! │  │ DocumentChannel │  kinds 9337,       │ PresenceChannel  │    │
//! │  │  yrs Doc        │  31338, 9338       │  Roster          │    │
//! │  │  SnapshotCache  │                    │  kind 31339      │    │
//! │  └───────┬─────────┘                    └────────┬─────────┘    │
//! └──────────┼───────────────────────────────────────┼──────────────┘
//!            │  sign (Signer) + publish / subscribe  │
//!            ▼                                       ▼
//!     ┌─────────────────────── Transport ─────────────────────┐
//!     │  RelaySet ── RelayPool ── RelayConnection (per url)   │
//!     │  MemoryHub (in-process loopback)                      │
//!     └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Relay frames, filters and event kinds
//! - [`event`] — Event ids and signed events
//! - [`identity`] — Keys, group keys and the [`Signer`] seam
//! - [`payload`] — Typed decoding of event contents
//! - [`relay`] — Reconnecting websocket connections and the shared pool
//! - [`transport`] — Publish fan-out and the in-memory hub
//! - [`document`] — CRDT replication channel
//! - [`presence`] — Presence roster and channel
//! - [`snapshot`] — Full-state snapshots
//! - [`storage`] — Local RocksDB cache
//! - [`session`] — Document + presence, opened together

pub mod clock;
pub mod config;
pub mod document;
pub mod error;
pub mod event;
pub mod identity;
pub mod origin;
pub mod payload;
pub mod presence;
pub mod profile;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AckPolicy, CollabConfig, ConfigError, PresenceConfig, RelayConfig, SnapshotConfig};
pub use document::{ChannelState, DocumentChannel, DocumentOptions, IngestOutcome};
pub use error::CollabError;
pub use event::{SignedEvent, UnsignedEvent, DOCUMENT_TAG};
pub use identity::{derive_group_key, IdentityError, Keys, ParticipantMode, Signer};
pub use origin::TxnOrigin;
pub use payload::{Payload, PayloadError, PresenceAnnouncement};
pub use presence::{
    display_name, ClientId, PresenceChannel, PresenceOptions, Roster, RosterChange, RosterEntry,
    StableIdentity,
};
pub use profile::{color_for, fetch_profile, Profile};
pub use protocol::{ClientMessage, EventKind, Filter, ProtocolError, RelayMessage};
pub use relay::{ConnectionState, RelayConnection, RelayError, RelayPool, RelaySet};
pub use session::{AppKind, DocumentSession, SessionOptions, UnknownApp};
pub use snapshot::{SnapshotCache, SnapshotKind};
pub use storage::{DocumentStore, MemoryStore, Persistence, StoreConfig, StoreError};
pub use transport::{
    InboundEvent, MemoryHub, PublishError, PublishReceipt, SubscribeError, Transport,
};
