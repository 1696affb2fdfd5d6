//! File-based storage backend: one JSON snapshot file plus a directory of
//! per-session credential folders

use crate::{CredentialStore, Credentials, SessionId, SessionSnapshot, SessionStore, StorageError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Name of the credential file inside a session's credential folder
const CREDENTIALS_FILE: &str = "creds.json";

/// Snapshot store writing the whole session table to a single JSON file
pub struct FileSessionStore {
    path: PathBuf,
    /// Serializes writers so the temp file is never shared
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Create a store for `path`, creating its parent directory
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self) -> Result<SessionSnapshot, StorageError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No session snapshot at {:?}, starting empty", self.path);
                return Ok(SessionSnapshot::new());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            warn!("Session snapshot {:?} is empty", self.path);
            return Ok(SessionSnapshot::new());
        }

        let snapshot: SessionSnapshot = serde_json::from_str(&content).map_err(|e| {
            StorageError::Corruption(format!("Invalid session snapshot {:?}: {}", self.path, e))
        })?;
        info!("Loaded {} sessions from {:?}", snapshot.len(), self.path);
        Ok(snapshot)
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<(), StorageError> {
        let content = serde_json::to_string_pretty(snapshot)?;
        let _guard = self.write_lock.lock().await;

        // Whole-file overwrite through a temp file so readers never see a torn write
        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!("Wrote snapshot of {} sessions to {:?}", snapshot.len(), self.path);
        Ok(())
    }
}

/// Credential store keeping `<dir>/<session id>/creds.json`
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Create a store rooted at `dir`, creating the directory
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn session_dir(&self, id: &SessionId) -> Result<PathBuf, StorageError> {
        let name = id.as_str();
        if name.is_empty() || name.contains(|c: char| c == '/' || c == '\\') || name == "." || name == ".." {
            return Err(StorageError::Invalid(format!("Unusable session id {:?}", name)));
        }
        Ok(self.dir.join(name))
    }

    fn credentials_file(&self, id: &SessionId) -> Result<PathBuf, StorageError> {
        Ok(self.session_dir(id)?.join(CREDENTIALS_FILE))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, id: &SessionId) -> Result<Option<Credentials>, StorageError> {
        let file = self.credentials_file(id)?;
        match tokio::fs::read_to_string(&file).await {
            Ok(content) => {
                let credentials = serde_json::from_str(&content).map_err(|e| {
                    StorageError::Corruption(format!("Invalid credentials for session {}: {}", id, e))
                })?;
                Ok(Some(credentials))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(&self, id: &SessionId, credentials: &Credentials) -> Result<(), StorageError> {
        let dir = self.session_dir(id)?;
        tokio::fs::create_dir_all(&dir).await?;
        let content = serde_json::to_string_pretty(credentials)?;
        tokio::fs::write(dir.join(CREDENTIALS_FILE), content).await?;
        debug!("Stored credentials for session {}", id);
        Ok(())
    }

    async fn exists(&self, id: &SessionId) -> Result<bool, StorageError> {
        let file = self.credentials_file(id)?;
        Ok(tokio::fs::try_exists(&file).await?)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), StorageError> {
        let dir = self.session_dir(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Deleted credentials for session {}", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Campaign, Session, SessionState};
    use tempfile::TempDir;

    fn sample_session(id: &str) -> Session {
        let mut session = Session::new(SessionId::from(id), "15550001111");
        session.state = SessionState::Connected;
        session.connected = true;
        session.campaign = Some(Campaign {
            target: "120363000000@g.us".to_string(),
            label: "Team".to_string(),
            messages: vec!["one".to_string(), "two".to_string()],
            cursor: 1,
            interval_seconds: 10,
        });
        session
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("sessions.json");

        let mut snapshot = SessionSnapshot::new();
        let session = sample_session("aaaa");
        snapshot.insert(session.id.clone(), session.clone());

        {
            let store = FileSessionStore::new(&path).await.unwrap();
            store.save(&snapshot).await.unwrap();
        }

        let reopened = FileSessionStore::new(&path).await.unwrap();
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&session.id), Some(&session));
        assert!(!reopened.temp_path().exists());
    }

    #[tokio::test]
    async fn test_snapshot_overwrites_instead_of_appending() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions.json")).await.unwrap();

        let mut snapshot = SessionSnapshot::new();
        snapshot.insert(SessionId::from("aaaa"), sample_session("aaaa"));
        snapshot.insert(SessionId::from("bbbb"), sample_session("bbbb"));
        store.save(&snapshot).await.unwrap();

        snapshot.remove(&SessionId::from("aaaa"));
        store.save(&snapshot).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&SessionId::from("bbbb")));
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("none.json")).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileSessionStore::new(&path).await.unwrap();
        assert!(matches!(store.load().await, Err(StorageError::Corruption(_))));
    }

    #[tokio::test]
    async fn test_credentials_lifecycle() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path()).await.unwrap();
        let id = SessionId::from("cafe");

        assert!(!store.exists(&id).await.unwrap());
        assert_eq!(store.load(&id).await.unwrap(), None);

        let creds = Credentials::new(serde_json::json!({ "registered": true, "me": "15550001111" }));
        store.store(&id, &creds).await.unwrap();
        assert!(store.exists(&id).await.unwrap());
        assert!(dir.path().join("cafe").join(CREDENTIALS_FILE).exists());
        assert_eq!(store.load(&id).await.unwrap(), Some(creds));

        store.delete(&id).await.unwrap();
        assert!(!store.exists(&id).await.unwrap());
        assert!(!dir.path().join("cafe").exists());

        // Deleting again is harmless
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileCredentialStore::new(dir.path()).await.unwrap();
        let result = store.exists(&SessionId::from("../escape")).await;
        assert!(matches!(result, Err(StorageError::Invalid(_))));
    }
}
