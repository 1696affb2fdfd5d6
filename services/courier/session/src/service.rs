//! Operator-facing command layer.
//!
//! Wires the registry, scheduler and connection manager together and
//! exposes the handful of commands an operator issues: log a number in,
//! start a campaign, list groups, stop a session.

use crate::connection::{ConnectionConfig, ConnectionManager};
use crate::error::{Result, SessionError};
use crate::pairing::{normalize_phone_number, PairingNotifier, PairingReply};
use crate::registry::SessionRegistry;
use crate::scheduler::MessageScheduler;
use crate::transport::{GroupInfo, Transport};
use courier_storage::{Campaign, Session, SessionId, SessionState, Storage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Service tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Connection manager tunables
    pub connection: ConnectionConfig,
    /// How long `login` waits for a pairing code or a connection
    pub login_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            login_timeout: Duration::from_secs(180),
        }
    }
}

/// What a login produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    /// Enter this code on the device to link it
    PairingCode(String),
    /// The identity was already registered and is connected
    Connected,
}

/// Result of a successful login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    /// Newly created session
    pub session_id: SessionId,
    /// Pairing code or connection confirmation
    pub reply: LoginReply,
}

/// Campaign parameters supplied by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignRequest {
    /// Group id or bare number
    pub target: String,
    /// Prefix for every message
    pub label: String,
    /// Messages, dispatched in order and then from the start again
    pub messages: Vec<String>,
    /// Seconds between messages, 0 for the default
    pub interval_seconds: u64,
}

/// Split a message file into messages: one per non-blank line, trimmed
pub fn parse_messages(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse an interval in whole seconds; anything unusable selects the default
pub fn parse_interval(raw: &str) -> u64 {
    raw.trim().parse().unwrap_or(0)
}

/// Session orchestrator facade
pub struct SessionService {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<MessageScheduler>,
    connections: Arc<ConnectionManager>,
    login_timeout: Duration,
}

impl SessionService {
    /// Build the orchestrator on top of `storage` and `transport`
    pub fn new(storage: Storage, transport: Arc<dyn Transport>, config: ServiceConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(storage.sessions.clone()));
        let scheduler = Arc::new(MessageScheduler::new(registry.clone()));
        let connections = ConnectionManager::new(
            registry.clone(),
            scheduler.clone(),
            transport,
            storage.credentials.clone(),
            config.connection,
        );
        Self {
            registry,
            scheduler,
            connections,
            login_timeout: config.login_timeout,
        }
    }

    /// Session table
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Connection manager
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Reload persisted sessions and reconnect them silently
    pub async fn restore(&self) -> Result<usize> {
        self.registry.restore_all(&self.connections).await
    }

    /// Create a session for `phone_number` and wait for its pairing outcome
    pub async fn login(&self, phone_number: &str) -> Result<LoginOutcome> {
        let phone_number = normalize_phone_number(phone_number);
        if phone_number.is_empty() {
            return Err(SessionError::InvalidPhoneNumber(phone_number));
        }

        let id = self.registry.create(&phone_number).await?;
        let (notifier, reply) = PairingNotifier::channel();

        // The connection lifecycle outlives this call
        let connections = self.connections.clone();
        let start_id = id.clone();
        tokio::spawn(async move {
            connections.start(&start_id, Some(notifier)).await;
        });

        let reply = match tokio::time::timeout(self.login_timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(SessionError::PairingFailed {
                    id,
                    reason: "session ended before pairing".to_string(),
                })
            }
            Err(_) => {
                warn!("No pairing outcome for session {} within {:?}", id, self.login_timeout);
                return Err(SessionError::PairingTimeout(id));
            }
        };

        match reply {
            PairingReply::Code(code) => Ok(LoginOutcome {
                session_id: id,
                reply: LoginReply::PairingCode(code),
            }),
            PairingReply::Connected => Ok(LoginOutcome {
                session_id: id,
                reply: LoginReply::Connected,
            }),
            PairingReply::Failed(reason) => Err(SessionError::PairingFailed { id, reason }),
        }
    }

    /// Configure a campaign on a connected session and start dispatching it
    pub async fn start_campaign(&self, id: &SessionId, request: CampaignRequest) -> Result<()> {
        let target = request.target.trim().to_string();
        if target.is_empty() {
            return Err(SessionError::InvalidCampaign("target is required".to_string()));
        }
        if request.messages.is_empty() {
            return Err(SessionError::InvalidCampaign("no messages to send".to_string()));
        }

        let session = self.registry.get(id).await?;
        let handle = match self.connections.handle(id).await {
            Some(handle) if session.state == SessionState::Connected => handle,
            _ => return Err(SessionError::NotConnected(id.clone())),
        };

        let campaign = Campaign {
            target,
            label: request.label,
            messages: request.messages,
            cursor: 0,
            interval_seconds: request.interval_seconds,
        };
        let count = campaign.messages.len();

        // Retire the old queue first so its in-flight send cannot record a
        // cursor against the new campaign
        self.scheduler.stop(id);
        self.registry
            .update(id, |session| {
                session.campaign = Some(campaign);
                Ok(())
            })
            .await?;
        // A reconnect may have rebuilt a queue from the old campaign meanwhile
        self.scheduler.stop(id);
        self.scheduler.start(id, handle).await?;
        info!("Campaign of {} messages started for session {}", count, id);
        Ok(())
    }

    /// Stop and forget a session
    pub async fn stop(&self, id: &SessionId) -> Result<()> {
        self.connections.stop(id).await
    }

    /// Groups of a connected session
    pub async fn list_groups(&self, id: &SessionId) -> Result<Vec<GroupInfo>> {
        self.connections.list_groups(id).await
    }

    /// Copies of every session
    pub async fn sessions(&self) -> Vec<Session> {
        self.registry.list().await
    }

    /// Close every link and timer; persisted state is kept
    pub async fn shutdown(&self) {
        self.connections.shutdown().await;
    }
}
