//! Connection lifecycle of every session.
//!
//! The manager owns the live transport links, the pending retry timers and
//! the pairing notifiers. Each link gets a generation number and its event
//! pump tags every event with it, so events arriving from a connection that
//! has since been replaced are dropped instead of corrupting the state of
//! the new one.

use crate::error::{Result, SessionError, TransportError};
use crate::pairing::{format_pairing_code, normalize_phone_number, PairingNotifier, PairingReply};
use crate::policy::{ReconnectionPolicy, RetryDecision};
use crate::registry::{apply_transition, SessionRegistry};
use crate::scheduler::MessageScheduler;
use crate::transport::{
    ConnectRequest, Connection, DisconnectReason, GroupInfo, Transport, TransportConfig,
    TransportEvent, TransportHandle,
};
use courier_storage::{CredentialStore, Credentials, SessionId, SessionState};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Tunables of the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Parameters handed to the transport provider
    pub transport: TransportConfig,
    /// Retry delays
    pub policy: ReconnectionPolicy,
    /// Wait before asking for a pairing code on an unregistered identity
    pub pairing_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            policy: ReconnectionPolicy::default(),
            pairing_delay: Duration::from_secs(3),
        }
    }
}

struct Link {
    generation: u64,
    handle: Arc<dyn TransportHandle>,
    pump: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.pump.abort();
        self.handle.close();
    }
}

/// Marks a session as having a start in progress until dropped
struct StartGuard<'a> {
    starting: &'a DashSet<SessionId>,
    id: SessionId,
}

impl<'a> StartGuard<'a> {
    fn acquire(starting: &'a DashSet<SessionId>, id: &SessionId) -> Option<Self> {
        if starting.insert(id.clone()) {
            Some(Self {
                starting,
                id: id.clone(),
            })
        } else {
            None
        }
    }
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.id);
    }
}

/// Drives sessions through INIT, PAIRED, CONNECTED, RECONNECTING and STOPPED
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    scheduler: Arc<MessageScheduler>,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialStore>,
    config: ConnectionConfig,
    links: Mutex<HashMap<SessionId, Link>>,
    notifiers: DashMap<SessionId, PairingNotifier>,
    retries: DashMap<SessionId, (u64, JoinHandle<()>)>,
    starting: DashSet<SessionId>,
    next_generation: AtomicU64,
    next_retry: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager
    pub fn new(
        registry: Arc<SessionRegistry>,
        scheduler: Arc<MessageScheduler>,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialStore>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scheduler,
            transport,
            credentials,
            config,
            links: Mutex::new(HashMap::new()),
            notifiers: DashMap::new(),
            retries: DashMap::new(),
            starting: DashSet::new(),
            next_generation: AtomicU64::new(0),
            next_retry: AtomicU64::new(0),
        })
    }

    /// Connection parameters in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Open (or reopen) the transport of a session.
    ///
    /// A `notifier` receives the pairing outcome of an interactive login;
    /// restored sessions and retries pass `None`. Errors are not returned:
    /// a failed attempt is logged and retried after the fallback delay.
    pub async fn start(self: &Arc<Self>, id: &SessionId, notifier: Option<PairingNotifier>) {
        if let Some(notifier) = notifier {
            self.notifiers.insert(id.clone(), notifier);
        }

        let _guard = match StartGuard::acquire(&self.starting, id) {
            Some(guard) => guard,
            None => {
                debug!("Start already in progress for session {}", id);
                return;
            }
        };

        if let Err(e) = self.establish(id).await {
            match self.registry.state(id).await {
                None | Some(SessionState::Stopped) => {
                    debug!("Session {} stopped while connecting: {}", id, e);
                }
                Some(_) => {
                    let delay = self.config.policy.fallback_delay();
                    error!("Error connecting session {}: {} (retrying in {:?})", id, e, delay);
                    self.schedule_retry(id.clone(), delay);
                }
            }
        }
    }

    async fn establish(self: &Arc<Self>, id: &SessionId) -> Result<()> {
        let session = self.registry.get(id).await?;
        if session.state == SessionState::Stopped {
            return Ok(());
        }
        if session.state == SessionState::Connected && self.links.lock().await.contains_key(id) {
            debug!("Session {} is already connected", id);
            return Ok(());
        }

        // This attempt supersedes any pending retry
        self.cancel_retry(id);
        if let Some(previous) = self.links.lock().await.remove(id) {
            debug!("Tearing down previous connection of session {}", id);
            previous.abort();
        }

        let credentials = match self.credentials.load(id).await {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Failed to load credentials for session {}: {}", id, e);
                None
            }
        };

        let request = ConnectRequest {
            session_id: id.clone(),
            credentials,
            config: self.config.transport.clone(),
        };
        let connect_timeout = self.config.transport.connect_timeout;
        let connection = tokio::time::timeout(connect_timeout, self.transport.connect(request))
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))??;

        match self.registry.state(id).await {
            None | Some(SessionState::Stopped) => {
                debug!("Session {} stopped while connecting, discarding link", id);
                connection.handle.close();
                return Ok(());
            }
            Some(_) => {}
        }

        let Connection { handle, events } = connection;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut links = self.links.lock().await;
            let pump = self.spawn_event_pump(id.clone(), generation, events);
            if let Some(stale) = links.insert(
                id.clone(),
                Link {
                    generation,
                    handle: handle.clone(),
                    pump,
                },
            ) {
                stale.abort();
            }
        }
        info!("Transport link {} established for session {}", generation, id);

        // The start guard is not held across pairing; a retry may begin
        // during the pairing delay
        if !handle.is_registered() {
            let manager = Arc::clone(self);
            let pair_id = id.clone();
            tokio::spawn(async move {
                manager.pair(&pair_id, generation, handle).await;
            });
        }
        Ok(())
    }

    /// Obtain a pairing code for an unregistered identity, if a caller is
    /// waiting for one
    async fn pair(&self, id: &SessionId, generation: u64, handle: Arc<dyn TransportHandle>) {
        let notifier = match self.notifiers.get(id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("Session {} is unregistered and nobody awaits a pairing code", id);
                return;
            }
        };

        tokio::time::sleep(self.config.pairing_delay).await;

        let session = match self.registry.get(id).await {
            Ok(session) => session,
            Err(_) => return,
        };
        if session.state != SessionState::Init
            || notifier.is_spent()
            || !self.is_current(id, generation).await
        {
            debug!("Skipping pairing for session {} ({})", id, session.state);
            return;
        }

        let phone_number = normalize_phone_number(&session.phone_number);
        match handle.request_pairing_code(&phone_number).await {
            Ok(code) => {
                let formatted = format_pairing_code(&code);
                let paired = self
                    .registry
                    .update(id, |s| {
                        if s.state == SessionState::Init {
                            apply_transition(s, SessionState::Paired)?;
                        }
                        Ok(())
                    })
                    .await;
                if let Err(e) = paired {
                    warn!("Failed to mark session {} as paired: {}", id, e);
                }
                if notifier.notify(PairingReply::Code(formatted.clone())) {
                    info!("Pairing code {} issued for session {}", formatted, id);
                } else {
                    debug!("Pairing code for session {} had no receiver", id);
                }
            }
            Err(e) => {
                error!("Error requesting pairing code for session {}: {}", id, e);
                notifier.notify(PairingReply::Failed(e.to_string()));
            }
        }
        self.notifiers.remove(id);
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        id: SessionId,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, TransportEvent::Close(_));
                manager.handle_event(&id, generation, event).await;
                if closed {
                    break;
                }
            }
            debug!("Event pump of link {} for session {} ended", generation, id);
        })
    }

    async fn is_current(&self, id: &SessionId, generation: u64) -> bool {
        self.links
            .lock()
            .await
            .get(id)
            .map(|link| link.generation == generation)
            .unwrap_or(false)
    }

    async fn handle_event(self: &Arc<Self>, id: &SessionId, generation: u64, event: TransportEvent) {
        if !self.is_current(id, generation).await {
            debug!(
                "Ignoring {:?} from superseded link {} of session {}",
                event, generation, id
            );
            return;
        }

        match event {
            TransportEvent::Open => self.handle_open(id).await,
            TransportEvent::Close(reason) => self.handle_close(id, generation, reason).await,
            TransportEvent::CredentialsUpdated(credentials) => {
                self.handle_credentials(id, credentials).await
            }
        }
    }

    async fn handle_open(&self, id: &SessionId) {
        let opened = self
            .registry
            .update(id, |s| {
                apply_transition(s, SessionState::Connected)?;
                s.connected = true;
                s.reconnect_attempts = 0;
                Ok(s.campaign.is_some())
            })
            .await;

        let has_campaign = match opened {
            Ok(has_campaign) => has_campaign,
            Err(e) => {
                debug!("Ignoring open for session {}: {}", id, e);
                return;
            }
        };
        info!("Session {} connected", id);

        if let Some((_, notifier)) = self.notifiers.remove(id) {
            notifier.notify(PairingReply::Connected);
        }

        if has_campaign {
            if let Some(handle) = self.handle(id).await {
                if let Err(e) = self.scheduler.start(id, handle).await {
                    warn!("Could not resume campaign of session {}: {}", id, e);
                }
            }
        }
    }

    async fn handle_close(self: &Arc<Self>, id: &SessionId, generation: u64, reason: DisconnectReason) {
        match self.registry.state(id).await {
            None | Some(SessionState::Stopped) => return,
            Some(_) => {}
        }

        let credentials_present = match self.credentials.exists(id).await {
            Ok(present) => present,
            Err(e) => {
                warn!("Failed to check credentials of session {}: {}", id, e);
                true
            }
        };

        self.scheduler.pause(id);
        self.release_link(id, generation).await;

        match self.config.policy.decide(reason, credentials_present) {
            RetryDecision::Stop => {
                warn!("Session {} logged out ({}), not reconnecting", id, reason);
                self.scheduler.stop(id);
                let stopped = self
                    .registry
                    .update(id, |s| {
                        apply_transition(s, SessionState::Stopped)?;
                        s.connected = false;
                        Ok(())
                    })
                    .await;
                if let Err(e) = stopped {
                    warn!("Failed to stop session {}: {}", id, e);
                }
                if let Some((_, notifier)) = self.notifiers.remove(id) {
                    notifier.notify(PairingReply::Failed(format!("logged out ({})", reason)));
                }
            }
            RetryDecision::Retry => {
                let attempts = self
                    .registry
                    .update(id, |s| {
                        if s.state == SessionState::Connected {
                            apply_transition(s, SessionState::Reconnecting)?;
                        }
                        s.connected = false;
                        s.reconnect_attempts = s.reconnect_attempts.saturating_add(1);
                        Ok(s.reconnect_attempts)
                    })
                    .await;

                match attempts {
                    Ok(attempts) => {
                        let delay = self.config.policy.delay(attempts);
                        info!(
                            "Connection of session {} closed ({}), reconnecting in {:?} (attempt {})",
                            id, reason, delay, attempts
                        );
                        self.schedule_retry(id.clone(), delay);
                    }
                    Err(e) => debug!("Not reconnecting session {}: {}", id, e),
                }
            }
        }
    }

    async fn handle_credentials(&self, id: &SessionId, credentials: Credentials) {
        match self.registry.state(id).await {
            None | Some(SessionState::Stopped) => {
                debug!("Dropping credentials update for stopped session {}", id);
            }
            Some(_) => match self.credentials.store(id, &credentials).await {
                Ok(()) => debug!("Credentials of session {} updated", id),
                Err(e) => error!("Failed to store credentials of session {}: {}", id, e),
            },
        }
    }

    /// Forget the link of `generation` and close its handle. Called from
    /// the link's own pump, so the pump itself is left to finish.
    async fn release_link(&self, id: &SessionId, generation: u64) {
        let mut links = self.links.lock().await;
        if links.get(id).map(|l| l.generation) == Some(generation) {
            if let Some(link) = links.remove(id) {
                link.handle.close();
            }
        }
    }

    /// Replace any pending retry of the session with one firing after `delay`
    fn schedule_retry(self: &Arc<Self>, id: SessionId, delay: Duration) {
        let token = self.next_retry.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = Arc::clone(self);
        let retry_id = id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager
                .retries
                .remove_if(&retry_id, |_, (pending, _)| *pending == token);
            manager.start(&retry_id, None).await;
        });

        if let Some((_, previous)) = self.retries.insert(id, (token, task)) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, id: &SessionId) {
        if let Some((_, (_, task))) = self.retries.remove(id) {
            task.abort();
        }
    }

    /// Whether a retry is pending for the session
    pub fn has_pending_retry(&self, id: &SessionId) -> bool {
        self.retries.contains_key(id)
    }

    /// Live transport handle of a session
    pub async fn handle(&self, id: &SessionId) -> Option<Arc<dyn TransportHandle>> {
        self.links.lock().await.get(id).map(|link| link.handle.clone())
    }

    /// Groups the session's identity participates in
    pub async fn list_groups(&self, id: &SessionId) -> Result<Vec<GroupInfo>> {
        let session = self.registry.get(id).await?;
        if session.state != SessionState::Connected {
            return Err(SessionError::NotConnected(id.clone()));
        }
        let handle = self
            .handle(id)
            .await
            .ok_or_else(|| SessionError::NotConnected(id.clone()))?;
        Ok(handle.list_groups().await?)
    }

    /// Stop a session for good: cancel everything it owns, log it out,
    /// delete its credentials and remove it from the registry
    pub async fn stop(&self, id: &SessionId) -> Result<()> {
        self.registry
            .update(id, |s| {
                apply_transition(s, SessionState::Stopped)?;
                s.connected = false;
                Ok(())
            })
            .await?;

        self.scheduler.stop(id);
        self.cancel_retry(id);
        if let Some((_, notifier)) = self.notifiers.remove(id) {
            notifier.notify(PairingReply::Failed("session stopped".to_string()));
        }

        let link = self.links.lock().await.remove(id);
        if let Some(link) = link {
            link.pump.abort();
            if let Err(e) = link.handle.logout().await {
                warn!("Logout of session {} failed: {}", id, e);
            }
            link.handle.close();
        }

        if let Err(e) = self.credentials.delete(id).await {
            warn!("Failed to delete credentials of session {}: {}", id, e);
        }

        self.registry.remove(id).await?;
        info!("Session {} stopped", id);
        Ok(())
    }

    /// Close every link and cancel every timer, leaving persisted state as
    /// is for the next process to restore
    pub async fn shutdown(&self) {
        let retries: Vec<SessionId> = self.retries.iter().map(|e| e.key().clone()).collect();
        for id in &retries {
            self.cancel_retry(id);
        }
        self.scheduler.shutdown();
        self.notifiers.clear();

        let links: Vec<(SessionId, Link)> = self.links.lock().await.drain().collect();
        let count = links.len();
        for (_, link) in links {
            link.abort();
        }
        info!("Connection manager shut down ({} links closed)", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackOptions, LoopbackTransport};
    use async_trait::async_trait;
    use courier_storage::{Campaign, MemoryCredentialStore, MemorySessionStore, Session, SessionSnapshot};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        scheduler: Arc<MessageScheduler>,
        credentials: Arc<MemoryCredentialStore>,
        transport: LoopbackTransport,
        manager: Arc<ConnectionManager>,
    }

    fn fixture_with(transport: LoopbackTransport, store: MemorySessionStore) -> Fixture {
        let registry = Arc::new(SessionRegistry::new(Arc::new(store)));
        let scheduler = Arc::new(MessageScheduler::new(registry.clone()));
        let credentials = Arc::new(MemoryCredentialStore::new());
        let manager = ConnectionManager::new(
            registry.clone(),
            scheduler.clone(),
            Arc::new(transport.clone()),
            credentials.clone(),
            ConnectionConfig::default(),
        );
        Fixture {
            registry,
            scheduler,
            credentials,
            transport,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(
            LoopbackTransport::new(LoopbackOptions::default()),
            MemorySessionStore::new(),
        )
    }

    fn registered() -> Credentials {
        Credentials::new(serde_json::json!({ "registered": true }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    impl Fixture {
        async fn connected_session(&self) -> SessionId {
            let id = self.registry.create("15550001111").await.unwrap();
            self.credentials.store(&id, &registered()).await.unwrap();
            self.manager.start(&id, None).await;
            assert!(self.transport.open(&id));
            settle().await;
            assert_eq!(self.registry.state(&id).await, Some(SessionState::Connected));
            id
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows_and_resets_after_open() {
        let f = fixture();
        let id = f.connected_session().await;

        for (attempt, delay_ms) in [(1u32, 2_000u64), (2, 4_000), (3, 6_000), (4, 8_000)] {
            let before = f.transport.connect_attempts();
            f.transport.close(&id, DisconnectReason::ConnectionLost);
            settle().await;

            let session = f.registry.get(&id).await.unwrap();
            assert_eq!(session.state, SessionState::Reconnecting);
            assert_eq!(session.reconnect_attempts, attempt);
            assert!(!session.connected);

            tokio::time::sleep(Duration::from_millis(delay_ms - 150)).await;
            assert_eq!(f.transport.connect_attempts(), before);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert_eq!(f.transport.connect_attempts(), before + 1);
        }

        f.transport.open(&id);
        settle().await;
        let session = f.registry.get(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.reconnect_attempts, 0);

        let before = f.transport.connect_attempts();
        f.transport.close(&id, DisconnectReason::ConnectionClosed);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(f.transport.connect_attempts(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_without_credentials_stops() {
        let f = fixture();
        let id = f.registry.create("15550001111").await.unwrap();
        f.manager.start(&id, None).await;

        f.transport.close(&id, DisconnectReason::LoggedOut);
        settle().await;
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Stopped));
        assert!(!f.manager.has_pending_retry(&id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_revocation_with_credentials_keeps_retrying() {
        let f = fixture();
        let id = f.connected_session().await;

        f.transport.close(&id, DisconnectReason::LoggedOut);
        settle().await;
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Reconnecting));
        assert!(f.manager.has_pending_retry(&id));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.transport.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_retries_after_fallback() {
        let f = fixture();
        let id = f.registry.create("15550001111").await.unwrap();
        f.transport.fail_next_connects(1);

        f.manager.start(&id, None).await;
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Init));
        assert!(f.manager.has_pending_retry(&id));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(f.transport.connect_attempts(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(f.transport.connect_attempts(), 2);
        assert!(f.manager.handle(&id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_then_restart_connects() {
        let f = fixture_with(
            LoopbackTransport::new(LoopbackOptions {
                pairing_code: Some("ABCDEFGH".to_string()),
                ..LoopbackOptions::automatic()
            }),
            MemorySessionStore::new(),
        );
        let id = f.registry.create("+1 555 000 1111").await.unwrap();
        let (notifier, rx) = PairingNotifier::channel();

        f.manager.start(&id, Some(notifier)).await;
        assert_eq!(rx.await.unwrap(), PairingReply::Code("ABCD-EFGH".to_string()));
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Paired));

        // Confirmation at 8s, restart request, reconnect 2s later
        tokio::time::sleep(Duration::from_secs(8)).await;
        let session = f.registry.get(&id).await.unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.reconnect_attempts, 0);
        assert!(f.credentials.exists(&id).await.unwrap());
        assert_eq!(f.transport.pairing_requests(), 1);
        assert_eq!(f.transport.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_failure_is_reported_once() {
        let f = fixture();
        f.transport.set_fail_pairing(true);
        let id = f.registry.create("15550001111").await.unwrap();
        let (notifier, rx) = PairingNotifier::channel();

        f.manager.start(&id, Some(notifier.clone())).await;
        assert!(matches!(rx.await.unwrap(), PairingReply::Failed(_)));
        assert!(notifier.is_spent());
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Init));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_pairing_delay_reconnects_and_pairs() {
        let f = fixture_with(
            LoopbackTransport::new(LoopbackOptions {
                pairing_code: Some("ABCDEFGH".to_string()),
                ..LoopbackOptions::default()
            }),
            MemorySessionStore::new(),
        );
        let id = f.registry.create("15550001111").await.unwrap();
        let (notifier, rx) = PairingNotifier::channel();

        f.manager.start(&id, Some(notifier)).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(f.transport.close(&id, DisconnectReason::ConnectionLost));
        settle().await;
        assert!(f.manager.has_pending_retry(&id));

        // Retry fires while the first link's pairing delay is still running
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.transport.connect_attempts(), 2);
        assert!(f.manager.handle(&id).await.is_some());

        assert_eq!(rx.await.unwrap(), PairingReply::Code("ABCD-EFGH".to_string()));
        assert_eq!(f.transport.pairing_requests(), 1);
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Paired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_reconnect_does_not_pair_twice() {
        let f = fixture_with(
            LoopbackTransport::new(LoopbackOptions {
                pairing_code: Some("ABCDEFGH".to_string()),
                ..LoopbackOptions::default()
            }),
            MemorySessionStore::new(),
        );
        let id = f.registry.create("15550001111").await.unwrap();
        let (notifier, rx) = PairingNotifier::channel();

        f.manager.start(&id, Some(notifier.clone())).await;
        assert_eq!(rx.await.unwrap(), PairingReply::Code("ABCD-EFGH".to_string()));

        // The code was issued but never confirmed; the next link is unregistered too
        assert!(f.transport.close(&id, DisconnectReason::ConnectionLost));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.transport.connect_attempts(), 2);

        f.manager.start(&id, Some(notifier.clone())).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.transport.connect_attempts(), 3);

        assert_eq!(f.transport.pairing_requests(), 1);
        assert!(!notifier.notify(PairingReply::Code("AAAA-BBBB".to_string())));
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Paired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observed_transitions_follow_edges() {
        let f = fixture();
        let id = f.registry.create("15550001111").await.unwrap();
        f.credentials.store(&id, &registered()).await.unwrap();
        let mut observed = vec![f.registry.state(&id).await.unwrap()];

        f.manager.start(&id, None).await;
        f.transport.open(&id);
        settle().await;
        observed.push(f.registry.state(&id).await.unwrap());

        f.transport.close(&id, DisconnectReason::ConnectionReplaced);
        settle().await;
        observed.push(f.registry.state(&id).await.unwrap());

        // Reconnected link closes again before opening
        tokio::time::sleep(Duration::from_secs(2)).await;
        f.transport.close(&id, DisconnectReason::ConnectionLost);
        settle().await;
        observed.push(f.registry.state(&id).await.unwrap());

        tokio::time::sleep(Duration::from_secs(5)).await;
        f.transport.open(&id);
        settle().await;
        observed.push(f.registry.state(&id).await.unwrap());

        assert_eq!(
            observed,
            vec![
                SessionState::Init,
                SessionState::Connected,
                SessionState::Reconnecting,
                SessionState::Reconnecting,
                SessionState::Connected,
            ]
        );
        for pair in observed.windows(2) {
            assert!(pair[0] == pair[1] || pair[0].can_transition_to(pair[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_session_resumes_campaign() {
        let id = SessionId::from("0123456789abcdef0123456789abcdef");
        let mut session = Session::new(id.clone(), "15550001111");
        session.state = SessionState::Connected;
        session.connected = true;
        session.campaign = Some(Campaign {
            target: "120363025246125888@g.us".to_string(),
            label: "Promo".to_string(),
            messages: vec!["m0".to_string(), "m1".to_string(), "m2".to_string()],
            cursor: 1,
            interval_seconds: 1,
        });
        let mut snapshot = SessionSnapshot::new();
        snapshot.insert(id.clone(), session);

        let f = fixture_with(
            LoopbackTransport::new(LoopbackOptions::automatic()),
            MemorySessionStore::with_snapshot(snapshot),
        );
        f.credentials.store(&id, &registered()).await.unwrap();

        let started = f.registry.restore_all(&f.manager).await.unwrap();
        assert_eq!(started, 1);
        settle().await;
        assert_eq!(f.registry.state(&id).await, Some(SessionState::Connected));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let sent = f.transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "Promo m1");
        assert_eq!(f.transport.pairing_requests(), 0);
        assert!(f.scheduler.is_running(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_tears_everything_down() {
        let f = fixture();
        let id = f.connected_session().await;

        f.manager.stop(&id).await.unwrap();
        assert_eq!(f.transport.logouts(), 1);
        assert!(f.transport.is_closed(&id));
        assert!(!f.credentials.exists(&id).await.unwrap());
        assert!(!f.registry.contains(&id).await);
        assert!(f.manager.handle(&id).await.is_none());

        assert!(matches!(f.manager.stop(&id).await, Err(SessionError::NotFound(_))));
        assert_eq!(f.transport.logouts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_groups_requires_connection() {
        let f = fixture();
        let id = f.registry.create("15550001111").await.unwrap();
        f.manager.start(&id, None).await;
        assert!(matches!(
            f.manager.list_groups(&id).await,
            Err(SessionError::NotConnected(_))
        ));

        f.transport.set_groups(vec![GroupInfo {
            name: "Team".to_string(),
            id: "1203630@g.us".to_string(),
        }]);
        f.transport.open(&id);
        settle().await;
        let groups = f.manager.list_groups(&id).await.unwrap();
        assert_eq!(groups[0].name, "Team");
    }

    /// Hands the test the sending half of every connection's event channel
    struct RecordingTransport {
        inner: LoopbackTransport,
        senders: std::sync::Mutex<Vec<mpsc::Sender<TransportEvent>>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn connect(&self, request: ConnectRequest) -> std::result::Result<Connection, TransportError> {
            let connection = self.inner.connect(request).await?;
            let (tx, rx) = mpsc::channel(8);
            self.senders.lock().unwrap().push(tx);
            Ok(Connection {
                handle: connection.handle,
                events: rx,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_superseded_link_are_ignored() {
        let transport = Arc::new(RecordingTransport {
            inner: LoopbackTransport::new(LoopbackOptions::default()),
            senders: std::sync::Mutex::new(Vec::new()),
        });
        let registry = Arc::new(SessionRegistry::new(Arc::new(MemorySessionStore::new())));
        let scheduler = Arc::new(MessageScheduler::new(registry.clone()));
        let manager = ConnectionManager::new(
            registry.clone(),
            scheduler,
            transport.clone(),
            Arc::new(MemoryCredentialStore::new()),
            ConnectionConfig::default(),
        );
        let id = registry.create("15550001111").await.unwrap();

        manager.start(&id, None).await;
        manager.start(&id, None).await;
        let senders = transport.senders.lock().unwrap().clone();
        assert_eq!(senders.len(), 2);

        let _ = senders[0].send(TransportEvent::Open).await;
        settle().await;
        assert_eq!(registry.state(&id).await, Some(SessionState::Init));

        senders[1].send(TransportEvent::Open).await.unwrap();
        settle().await;
        assert_eq!(registry.state(&id).await, Some(SessionState::Connected));
    }
}
