//! Local persistence of document state.
//!
//! ```text
//! ┌─────────────────┐  full state after    ┌──────────────────────┐
//! │ DocumentChannel │  committed changes   │ Persistence          │
//! │                 │ ───────────────────► │  ├─ DocumentStore    │
//! │                 │ ◄─────────────────── │  │   (RocksDB + LZ4) │
//! └─────────────────┘  merged at open      │  └─ MemoryStore      │
//!                      (historical origin) └──────────────────────┘
//! ```
//!
//! Restored state is merged like any other CRDT update, so a stale cache
//! never overrides newer network state.

pub mod rocks;

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub trait Persistence: Send + Sync {
    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError>;

    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Process-local store, handy for tests and local mode.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    fn save(&self, document_id: &str, state: &[u8]) -> Result<(), StoreError> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(document_id.to_string(), state.to_vec());
        Ok(())
    }

    fn load(&self, document_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(document_id)
            .cloned())
    }
}
