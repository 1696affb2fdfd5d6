//! In-memory table of every session, backed by whole-table snapshots.

use crate::connection::ConnectionManager;
use crate::error::{Result, SessionError};
use courier_storage::{Campaign, Session, SessionId, SessionSnapshot, SessionState, SessionStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Partial update applied by [`SessionRegistry::upsert`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    /// New digits-only identity
    pub phone_number: Option<String>,
    /// Requested state, validated against the state machine
    pub state: Option<SessionState>,
    /// Transport openness snapshot
    pub connected: Option<bool>,
    /// `Some(None)` clears the campaign
    pub campaign: Option<Option<Campaign>>,
    /// Reconnection counter
    pub reconnect_attempts: Option<u32>,
}

/// Move `session` to `to`, staying put when it is already there
pub(crate) fn apply_transition(session: &mut Session, to: SessionState) -> Result<()> {
    if session.state == to {
        return Ok(());
    }
    if !session.state.can_transition_to(to) {
        return Err(SessionError::InvalidTransition {
            id: session.id.clone(),
            from: session.state,
            to,
        });
    }
    debug!("Session {}: {} -> {}", session.id, session.state, to);
    session.state = to;
    Ok(())
}

/// Registry of sessions, the single owner of session descriptors
pub struct SessionRegistry {
    /// Live session table
    sessions: RwLock<SessionSnapshot>,
    /// Ids removed during this process lifetime; never handed out again.
    /// Only grows, one entry per removed session, and is not persisted.
    retired: RwLock<HashSet<SessionId>>,
    /// Durable snapshot target
    store: Arc<dyn SessionStore>,
    /// Serializes snapshot writes
    persist_lock: Mutex<()>,
}

impl SessionRegistry {
    /// Create an empty registry writing snapshots to `store`
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            sessions: RwLock::new(SessionSnapshot::new()),
            retired: RwLock::new(HashSet::new()),
            store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Register a new session in INIT for a digits-only identity
    pub async fn create(&self, phone_number: &str) -> Result<SessionId> {
        let id = {
            let mut sessions = self.sessions.write().await;
            let retired = self.retired.read().await;
            let id = loop {
                let candidate = SessionId::generate();
                if !sessions.contains_key(&candidate) && !retired.contains(&candidate) {
                    break candidate;
                }
            };
            sessions.insert(id.clone(), Session::new(id.clone(), phone_number));
            id
        };

        info!("Created session {} for {}", id, phone_number);
        self.persist().await;
        Ok(id)
    }

    /// Copy of a session
    pub async fn get(&self, id: &SessionId) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Current state, `None` if the session does not exist
    pub async fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.read().await.get(id).map(|s| s.state)
    }

    /// Whether a session exists
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Copies of all sessions, ordered by id
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Number of sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Apply `patch`, inserting a fresh INIT session first if the id is
    /// unknown. Retired ids are rejected with `NotFound`.
    pub async fn upsert(&self, id: &SessionId, patch: SessionPatch) -> Result<Session> {
        if self.retired.read().await.contains(id) {
            return Err(SessionError::NotFound(id.clone()));
        }

        let updated = {
            let mut sessions = self.sessions.write().await;
            let mut session = sessions
                .get(id)
                .cloned()
                .unwrap_or_else(|| Session::new(id.clone(), String::new()));

            if let Some(phone_number) = patch.phone_number {
                session.phone_number = phone_number;
            }
            if let Some(state) = patch.state {
                apply_transition(&mut session, state)?;
            }
            if let Some(connected) = patch.connected {
                session.connected = connected;
            }
            if let Some(campaign) = patch.campaign {
                session.campaign = campaign;
            }
            if let Some(attempts) = patch.reconnect_attempts {
                session.reconnect_attempts = attempts;
            }
            session.touch();
            sessions.insert(id.clone(), session.clone());
            session
        };

        self.persist().await;
        Ok(updated)
    }

    /// Run `f` against a session and persist the result. Nothing is
    /// written when `f` fails.
    pub async fn update<R, F>(&self, id: &SessionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut Session) -> Result<R>,
    {
        let result = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;

            // Work on a copy so a failing closure leaves the table untouched
            let mut draft = session.clone();
            let result = f(&mut draft)?;
            draft.touch();
            *session = draft;
            result
        };

        self.persist().await;
        Ok(result)
    }

    /// Move a session along a state-machine edge, returning the previous state
    pub async fn transition(&self, id: &SessionId, to: SessionState) -> Result<SessionState> {
        self.update(id, |session| {
            let from = session.state;
            apply_transition(session, to)?;
            Ok(from)
        })
        .await
    }

    /// Record the dispatch cursor of a session's campaign
    pub async fn set_campaign_cursor(&self, id: &SessionId, cursor: usize) -> Result<()> {
        self.update(id, |session| match session.campaign.as_mut() {
            Some(campaign) => {
                campaign.cursor = cursor;
                Ok(())
            }
            None => Err(SessionError::InvalidCampaign(format!(
                "session {} has no campaign",
                session.id
            ))),
        })
        .await
    }

    /// Remove a session for good. A second call for the same id reports
    /// `NotFound`.
    pub async fn remove(&self, id: &SessionId) -> Result<Session> {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let removed = sessions
                .remove(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            self.retired.write().await.insert(id.clone());
            removed
        };

        info!("Removed session {}", id);
        self.persist().await;
        Ok(removed)
    }

    /// Load the persisted snapshot and silently reconnect every session
    /// that is not STOPPED. Returns how many sessions were started.
    pub async fn restore_all(&self, connections: &Arc<ConnectionManager>) -> Result<usize> {
        let snapshot = self.store.load().await?;
        let mut to_start = Vec::new();

        {
            let mut sessions = self.sessions.write().await;
            for (key, mut session) in snapshot {
                if key.is_empty() || session.id.is_empty() {
                    warn!("Skipping persisted session without an id");
                    continue;
                }
                if session.id != key {
                    warn!("Persisted session key {} disagrees with id {}, using key", key, session.id);
                    session.id = key.clone();
                }

                // Nothing is open yet in this process
                session.connected = false;
                if session.state == SessionState::Connected {
                    apply_transition(&mut session, SessionState::Reconnecting)?;
                }
                if let Some(campaign) = session.campaign.as_mut() {
                    campaign.cursor = campaign.clamped_cursor();
                }

                if !session.state.is_terminal() {
                    to_start.push(key.clone());
                }
                sessions.insert(key, session);
            }
        }

        self.persist().await;

        // Each start may wait out the connect timeout
        let starts = to_start.iter().map(|id| async move {
            info!("Restoring session {}", id);
            connections.start(id, None).await;
        });
        futures::future::join_all(starts).await;

        info!("Restored {} sessions", to_start.len());
        Ok(to_start.len())
    }

    /// Write the whole table. Failures are logged; memory stays authoritative.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.sessions.read().await.clone();
        if let Err(e) = self.store.save(&snapshot).await {
            error!("Failed to persist session snapshot: {}", e);
        }
    }
}
