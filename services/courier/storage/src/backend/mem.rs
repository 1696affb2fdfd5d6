//! In-memory storage backend for development and testing

use crate::{CredentialStore, Credentials, SessionId, SessionSnapshot, SessionStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// In-memory snapshot store
#[derive(Default)]
pub struct MemorySessionStore {
    /// Last written snapshot
    snapshot: Arc<RwLock<SessionSnapshot>>,
    /// Number of successful writes
    writes: AtomicUsize,
    /// When set, every write fails with a backend error
    fail_writes: AtomicBool,
}

impl MemorySessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `snapshot`, as if written by an earlier process
    pub fn with_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
            ..Self::default()
        }
    }

    /// Number of successful snapshot writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Copy of the last written snapshot
    pub async fn current(&self) -> SessionSnapshot {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<SessionSnapshot, StorageError> {
        Ok(self.snapshot.read().await.clone())
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("memory store writes disabled".to_string()));
        }

        debug!("Memory snapshot write of {} sessions", snapshot.len());
        *self.snapshot.write().await = snapshot.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory credential store
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Arc<DashMap<SessionId, Credentials>>,
}

impl MemoryCredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Credentials>, StorageError> {
        Ok(self.entries.get(id).map(|entry| entry.value().clone()))
    }

    async fn store(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError> {
        self.entries.insert(id.clone(), credentials.clone());
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> Result<bool, StorageError> {
        Ok(self.entries.contains_key(id))
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StorageError> {
        self.entries.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;

    #[tokio::test]
    async fn test_memory_snapshot_write_and_failure() {
        let store = MemorySessionStore::new();
        let mut snapshot = SessionSnapshot::new();
        let id = SessionId::from("abcd");
        snapshot.insert(id.clone(), Session::new(id.clone(), "123"));

        store.save(&snapshot).await.unwrap();
        assert_eq!(store.write_count(), 1);
        assert!(store.load().await.unwrap().contains_key(&id));

        store.set_fail_writes(true);
        assert!(matches!(
            store.save(&SessionSnapshot::new()).await,
            Err(StorageError::Backend(_))
        ));
        // Failed write leaves the previous snapshot in place
        assert_eq!(store.write_count(), 1);
        assert!(store.current().await.contains_key(&id));
    }

    #[tokio::test]
    async fn test_memory_credentials() {
        let store = MemoryCredentialStore::new();
        let id = SessionId::from("abcd");
        assert!(!store.exists(&id).await.unwrap());

        let creds = Credentials::new(serde_json::json!({ "registered": false }));
        store.store(&id, &creds).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap(), Some(creds));

        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
    }
}
