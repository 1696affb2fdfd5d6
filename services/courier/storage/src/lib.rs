//! Session snapshot and credential persistence for courier.
//!
//! This crate provides the durable layer of the session orchestrator:
//! a whole-table snapshot of every session descriptor, written on every
//! state-affecting event, and per-session credential material written by
//! the transport provider. Both have pluggable backends (in-memory and
//! file-based).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod model;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use model::{Campaign, Session, SessionId, SessionSnapshot, SessionState, DEFAULT_INTERVAL_SECS};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted data could not be decoded
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque credential material produced by the transport provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(pub serde_json::Value);

impl Credentials {
    /// Wrap a JSON document
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Borrow the raw document
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Durable record of every session descriptor
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the last written snapshot (empty if nothing was ever written)
    async fn load(&self) -> Result<SessionSnapshot, StorageError>;

    /// Overwrite the stored snapshot with `snapshot`
    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError>;
}

/// Per-session credential material, kept apart from the snapshot
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load credentials for a session, if any were written
    async fn load(&self, id: &SessionId) -> Result<Option<Credentials>, StorageError>;

    /// Replace credentials for a session
    async fn store(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError>;

    /// Whether credential material currently exists for a session
    async fn exists(&self, id: &SessionId) -> Result<bool, StorageError>;

    /// Delete every credential artifact of a session (no-op if absent)
    async fn delete(&self, id: &SessionId) -> Result<(), StorageError>;
}

/// Combined storage interface
#[derive(Clone)]
pub struct Storage {
    /// Snapshot store for session descriptors
    pub sessions: Arc<dyn SessionStore>,
    /// Credential material store
    pub credentials: Arc<dyn CredentialStore>,
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// File-based storage
    File {
        /// Snapshot file path
        state_file: PathBuf,
        /// Directory holding one sub-directory of credentials per session
        credentials_dir: PathBuf,
    },
}

// Re-export backend implementations
pub use backend::file::{FileCredentialStore, FileSessionStore};
pub use backend::mem::{MemoryCredentialStore, MemorySessionStore};

impl Storage {
    /// Create storage from configuration
    pub async fn from_mode(mode: StorageMode) -> Result<Self, StorageError> {
        match mode {
            StorageMode::InMemory => Ok(Storage::in_memory()),
            StorageMode::File {
                state_file,
                credentials_dir,
            } => Ok(Storage {
                sessions: Arc::new(FileSessionStore::new(state_file).await?),
                credentials: Arc::new(FileCredentialStore::new(credentials_dir).await?),
            }),
        }
    }

    /// In-memory storage with fresh, empty stores
    pub fn in_memory() -> Self {
        Storage {
            sessions: Arc::new(MemorySessionStore::new()),
            credentials: Arc::new(MemoryCredentialStore::new()),
        }
    }
}
