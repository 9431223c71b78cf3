//! Transaction origin tagging.
//!
//! Every transaction applied by the replication layer carries an origin so
//! the outbound path can tell a participant's own edits apart from state
//! that arrived over the network. Untagged transactions count as local.

use yrs::{Origin, TransactionMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnOrigin {
    /// Edits made by the local participant. The only origin that is published.
    Local,
    /// Live updates received from relays.
    Remote,
    /// Snapshot or persisted state merged into the document.
    Historical,
}

impl TxnOrigin {
    const fn tag(self) -> &'static str {
        match self {
            Self::Local => "relaypad/local",
            Self::Remote => "relaypad/remote",
            Self::Historical => "relaypad/historical",
        }
    }

    /// Classifies a committed transaction.
    pub fn of(txn: &TransactionMut<'_>) -> Self {
        match txn.origin() {
            Some(origin) if *origin == Origin::from(Self::Remote.tag()) => Self::Remote,
            Some(origin) if *origin == Origin::from(Self::Historical.tag()) => Self::Historical,
            _ => Self::Local,
        }
    }

    pub const fn is_published(self) -> bool {
        match self {
            Self::Local => true,
            Self::Remote | Self::Historical => false,
        }
    }
}

impl From<TxnOrigin> for Origin {
    fn from(origin: TxnOrigin) -> Self {
        Origin::from(origin.tag())
    }
}
