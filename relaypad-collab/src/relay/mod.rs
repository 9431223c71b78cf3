//! Websocket relay connections.
//!
//! ```text
//!            acquire/release (refcounted)
//! RelayPool ───────────────────────────────► RelayConnection ── task ──► ws://relay
//!     ▲                                        │  REQ re-issued on every reconnect
//!     │ shared                                 │  frames queued while not open
//! RelaySet (Transport) ── publish fan-out ─────┘  OK acks matched by event id
//! ```

pub mod connection;
pub mod pool;

use std::time::Duration;

use crate::protocol::ProtocolError;

pub use connection::{ConnectionState, RelayConnection};
pub use pool::{RelayPool, RelaySet};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay rejected event: {0}")]
    Rejected(String),
    #[error("No acknowledgment within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
