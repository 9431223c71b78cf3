//! One collaborative document plus its presence, opened together.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use yrs::Doc;

use crate::clock::{Clock, SystemClock};
use crate::config::{CollabConfig, PresenceConfig, SnapshotConfig};
use crate::document::{DocumentChannel, DocumentOptions};
use crate::identity::{ParticipantMode, Signer};
use crate::presence::{PresenceChannel, PresenceOptions};
use crate::relay::{RelayPool, RelaySet};
use crate::storage::{DocumentStore, Persistence, StoreConfig};
use crate::transport::Transport;
use crate::CollabError;

/// Application a document belongs to. Each one but the editor namespaces
/// its document ids so that apps never share state by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AppKind {
    #[default]
    Editor,
    Todo,
    Poll,
    Whiteboard,
    Wiki,
    Mindmap,
}

impl AppKind {
    pub const ALL: [AppKind; 6] = [
        AppKind::Editor,
        AppKind::Todo,
        AppKind::Poll,
        AppKind::Whiteboard,
        AppKind::Wiki,
        AppKind::Mindmap,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            AppKind::Editor => "editor",
            AppKind::Todo => "todo",
            AppKind::Poll => "poll",
            AppKind::Whiteboard => "whiteboard",
            AppKind::Wiki => "wiki",
            AppKind::Mindmap => "mindmap",
        }
    }

    pub const fn namespace(self) -> Option<&'static str> {
        match self {
            AppKind::Editor => None,
            AppKind::Todo => Some("todo:"),
            AppKind::Poll => Some("poll:"),
            AppKind::Whiteboard => Some("whiteboard:"),
            AppKind::Wiki => Some("wiki:"),
            AppKind::Mindmap => Some("mindmap:"),
        }
    }

    /// Network document id for a bare id.
    pub fn document_id(self, bare: &str) -> String {
        match self.namespace() {
            Some(prefix) => format!("{prefix}{bare}"),
            None => bare.to_string(),
        }
    }
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown app: {0}")]
pub struct UnknownApp(pub String);

impl FromStr for AppKind {
    type Err = UnknownApp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AppKind::ALL
            .into_iter()
            .find(|app| app.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownApp(s.to_string()))
    }
}

pub struct SessionOptions {
    pub app: AppKind,
    /// Bare document id; the app namespace is added on open.
    pub document_id: String,
    pub transport: Arc<dyn Transport>,
    pub signer: Arc<dyn Signer>,
    pub mode: ParticipantMode,
    pub clock: Arc<dyn Clock>,
    pub presence: PresenceConfig,
    pub snapshot: SnapshotConfig,
    pub store: Option<Arc<dyn Persistence>>,
    pub doc: Option<Doc>,
}

impl SessionOptions {
    pub fn new(
        app: AppKind,
        document_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        Self {
            app,
            document_id: document_id.into(),
            transport,
            signer,
            mode: ParticipantMode::Personal,
            clock: Arc::new(SystemClock),
            presence: PresenceConfig::default(),
            snapshot: SnapshotConfig::default(),
            store: None,
            doc: None,
        }
    }

    /// Options for a session over the configured document relays, with
    /// the on-disk cache when `storage_path` is set.
    pub fn from_config(
        app: AppKind,
        document_id: impl Into<String>,
        config: &CollabConfig,
        pool: Arc<RelayPool>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, CollabError> {
        let transport = Arc::new(RelaySet::new(pool, &config.doc_relays));
        let mut options = Self::new(app, document_id, transport, signer);
        options.presence = config.presence.clone();
        options.snapshot = config.snapshot.clone();
        if let Some(path) = &config.storage_path {
            let store = DocumentStore::open(StoreConfig::at(path.clone()))?;
            options.store = Some(Arc::new(store));
        }
        Ok(options)
    }

    pub fn with_mode(mut self, mode: ParticipantMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Persistence>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_doc(mut self, doc: Doc) -> Self {
        self.doc = Some(doc);
        self
    }
}

/// A document channel and its presence channel. Presence uses the
/// document's CRDT client id as the logical participant id.
pub struct DocumentSession {
    app: AppKind,
    document: DocumentChannel,
    presence: PresenceChannel,
}

impl DocumentSession {
    pub async fn open(options: SessionOptions) -> Result<Self, CollabError> {
        let SessionOptions {
            app,
            document_id,
            transport,
            signer,
            mode,
            clock,
            presence,
            snapshot,
            store,
            doc,
        } = options;
        let document_id = app.document_id(&document_id);

        let mut document_options =
            DocumentOptions::new(document_id.clone(), transport.clone(), signer.clone())
                .with_clock(clock.clone())
                .with_snapshots(snapshot);
        if let Some(store) = store {
            document_options = document_options.with_store(store);
        }
        if let Some(doc) = doc {
            document_options = document_options.with_doc(doc);
        }
        let document = DocumentChannel::open(document_options).await?;

        let presence = PresenceChannel::open(
            PresenceOptions::new(document_id, document.client_id(), transport, signer)
                .with_mode(mode)
                .with_clock(clock)
                .with_config(presence),
        )
        .await?;

        log::info!("Session for {} ({app}) open", document.document_id());
        Ok(Self {
            app,
            document,
            presence,
        })
    }

    pub fn app(&self) -> AppKind {
        self.app
    }

    pub fn document_id(&self) -> &str {
        self.document.document_id()
    }

    pub fn doc(&self) -> &Doc {
        self.document.doc()
    }

    pub fn document(&self) -> &DocumentChannel {
        &self.document
    }

    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }

    pub fn close(&mut self) {
        self.presence.close();
        self.document.close();
    }
}
