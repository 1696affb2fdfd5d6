//! In-process transport provider.
//!
//! `LoopbackTransport` stands in for a real messaging network: it hands
//! out handles with an event channel, records every dispatched message and
//! lets the owner drive the connection lifecycle (open/close events,
//! injected failures, slow sends). The binary uses it in `loopback` mode
//! and the tests use it to exercise the orchestrator deterministically.

use crate::error::TransportError;
use crate::pairing::format_pairing_code;
use crate::transport::{
    ConnectRequest, Connection, Destination, DisconnectReason, GroupInfo, MessageAck, Transport,
    TransportEvent, TransportHandle,
};
use async_trait::async_trait;
use courier_storage::{Credentials, SessionId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of each connection's event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Behaviour switches of the loopback network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackOptions {
    /// Emit `Open` right after connecting when the identity is registered,
    /// and confirm pairing codes automatically
    pub auto_open: bool,
    /// Treat identities as registered even without credentials
    pub assume_registered: bool,
    /// Delay between issuing a pairing code and the simulated confirmation
    pub pairing_confirm_delay: Duration,
    /// Fixed raw pairing code (random when unset)
    pub pairing_code: Option<String>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            auto_open: false,
            assume_registered: false,
            pairing_confirm_delay: Duration::from_secs(5),
            pairing_code: None,
        }
    }
}

impl LoopbackOptions {
    /// Options for a self-driving network (used by the binary)
    pub fn automatic() -> Self {
        Self {
            auto_open: true,
            ..Self::default()
        }
    }
}

/// A message accepted by the loopback network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Sending session
    pub session_id: SessionId,
    /// Resolved destination
    pub destination: Destination,
    /// Message text
    pub content: String,
}

struct LinkEntry {
    events: mpsc::Sender<TransportEvent>,
    handle: Arc<LoopbackHandle>,
}

#[derive(Default)]
struct LoopbackState {
    options: LoopbackOptions,
    links: Mutex<HashMap<SessionId, LinkEntry>>,
    sent: Mutex<Vec<SentMessage>>,
    groups: Mutex<Vec<GroupInfo>>,
    send_delay: Mutex<Option<Duration>>,
    connect_attempts: AtomicUsize,
    pending_connect_failures: AtomicUsize,
    pending_send_failures: AtomicUsize,
    send_attempts: AtomicUsize,
    sends_in_flight: AtomicUsize,
    max_concurrent_sends: AtomicUsize,
    pairing_requests: AtomicUsize,
    fail_pairing: AtomicBool,
    logouts: AtomicUsize,
    next_message_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrement `counter` if it is positive; returns whether it was
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-process transport provider
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<LoopbackState>,
}

impl fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("options", &self.state.options)
            .field("links", &lock(&self.state.links).len())
            .finish()
    }
}

impl LoopbackTransport {
    /// Create a loopback network
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            state: Arc::new(LoopbackState {
                options,
                ..LoopbackState::default()
            }),
        }
    }

    /// Emit an event on the session's most recent connection
    pub fn emit(&self, id: &SessionId, event: TransportEvent) -> bool {
        let links = lock(&self.state.links);
        match links.get(id) {
            Some(link) => link.events.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Report the session's connection as open
    pub fn open(&self, id: &SessionId) -> bool {
        self.emit(id, TransportEvent::Open)
    }

    /// Close the session's connection with `reason`
    pub fn close(&self, id: &SessionId, reason: DisconnectReason) -> bool {
        if let Some(link) = lock(&self.state.links).get(id) {
            link.handle.closed.store(true, Ordering::SeqCst);
        }
        self.emit(id, TransportEvent::Close(reason))
    }

    /// Mark the session's identity as registered and rotate its credentials
    pub fn confirm_pairing(&self, id: &SessionId) -> bool {
        let phone_number = match lock(&self.state.links).get(id) {
            Some(link) => {
                link.handle.registered.store(true, Ordering::SeqCst);
                link.handle.phone_number.clone()
            }
            None => return false,
        };
        self.emit(id, TransportEvent::CredentialsUpdated(registered_credentials(&phone_number)))
    }

    /// Every message accepted so far
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.state.sent).clone()
    }

    /// Number of `connect` calls
    pub fn connect_attempts(&self) -> usize {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of `send_message` calls, including failed ones
    pub fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::SeqCst)
    }

    /// Highest number of sends observed outstanding at once
    pub fn max_concurrent_sends(&self) -> usize {
        self.state.max_concurrent_sends.load(Ordering::SeqCst)
    }

    /// Number of pairing code requests
    pub fn pairing_requests(&self) -> usize {
        self.state.pairing_requests.load(Ordering::SeqCst)
    }

    /// Number of logouts
    pub fn logouts(&self) -> usize {
        self.state.logouts.load(Ordering::SeqCst)
    }

    /// Whether the session's most recent handle was closed
    pub fn is_closed(&self, id: &SessionId) -> bool {
        lock(&self.state.links)
            .get(id)
            .map(|link| link.handle.closed.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    /// Fail the next `n` connection attempts
    pub fn fail_next_connects(&self, n: usize) {
        self.state.pending_connect_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends
    pub fn fail_next_sends(&self, n: usize) {
        self.state.pending_send_failures.store(n, Ordering::SeqCst);
    }

    /// Make every send take `delay` before completing
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *lock(&self.state.send_delay) = delay;
    }

    /// Make pairing code requests fail
    pub fn set_fail_pairing(&self, fail: bool) {
        self.state.fail_pairing.store(fail, Ordering::SeqCst);
    }

    /// Groups reported by `list_groups`
    pub fn set_groups(&self, groups: Vec<GroupInfo>) {
        *lock(&self.state.groups) = groups;
    }
}

fn registered_credentials(phone_number: &str) -> Credentials {
    Credentials::new(serde_json::json!({
        "registered": true,
        "me": phone_number,
    }))
}

fn is_registered(credentials: Option<&Credentials>) -> bool {
    credentials
        .and_then(|c| c.as_value().get("registered"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError> {
        let attempt = self.state.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if take_one(&self.state.pending_connect_failures) {
            warn!("Loopback refusing connection {} for session {}", attempt, request.session_id);
            return Err(TransportError::Connect("loopback refused connection".to_string()));
        }

        let registered =
            self.state.options.assume_registered || is_registered(request.credentials.as_ref());
        let phone_number = request
            .credentials
            .as_ref()
            .and_then(|c| c.as_value().get("me"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let handle = Arc::new(LoopbackHandle {
            session_id: request.session_id.clone(),
            phone_number,
            registered: AtomicBool::new(registered),
            closed: AtomicBool::new(false),
            events: tx.clone(),
            state: self.state.clone(),
        });

        lock(&self.state.links).insert(
            request.session_id.clone(),
            LinkEntry {
                events: tx.clone(),
                handle: handle.clone(),
            },
        );
        debug!(
            "Loopback connection {} for session {} (registered: {})",
            attempt, request.session_id, registered
        );

        if self.state.options.auto_open && registered {
            let _ = tx.try_send(TransportEvent::Open);
        }

        Ok(Connection { handle, events: rx })
    }
}

/// Handle of one loopback connection
pub struct LoopbackHandle {
    session_id: SessionId,
    phone_number: String,
    registered: AtomicBool,
    closed: AtomicBool,
    events: mpsc::Sender<TransportEvent>,
    state: Arc<LoopbackState>,
}

impl fmt::Debug for LoopbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackHandle")
            .field("session_id", &self.session_id)
            .field("registered", &self.registered.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl TransportHandle for LoopbackHandle {
    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        self.state.pairing_requests.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pairing.load(Ordering::SeqCst) {
            return Err(TransportError::Pairing("loopback pairing disabled".to_string()));
        }
        if phone_number.is_empty() {
            return Err(TransportError::Pairing("empty phone number".to_string()));
        }

        let code = match &self.state.options.pairing_code {
            Some(code) => code.clone(),
            None => rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(|b| char::from(b).to_ascii_uppercase())
                .collect(),
        };
        info!(
            "Loopback pairing code {} issued for session {}",
            format_pairing_code(&code),
            self.session_id
        );

        if self.state.options.auto_open {
            // Confirm, then ask for a fresh connection like a real network does
            let events = self.events.clone();
            let delay = self.state.options.pairing_confirm_delay;
            let credentials = registered_credentials(phone_number);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(TransportEvent::CredentialsUpdated(credentials)).await;
                let _ = events
                    .send(TransportEvent::Close(DisconnectReason::RestartRequired))
                    .await;
            });
        }

        Ok(code)
    }

    async fn send_message(
        &self,
        destination: &Destination,
        content: &str,
    ) -> Result<MessageAck, TransportError> {
        self.state.send_attempts.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let outstanding = self.state.sends_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state
            .max_concurrent_sends
            .fetch_max(outstanding, Ordering::SeqCst);

        let delay = *lock(&self.state.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.sends_in_flight.fetch_sub(1, Ordering::SeqCst);

        if take_one(&self.state.pending_send_failures) {
            return Err(TransportError::Send("loopback dropped message".to_string()));
        }

        lock(&self.state.sent).push(SentMessage {
            session_id: self.session_id.clone(),
            destination: destination.clone(),
            content: content.to_string(),
        });
        let id = self.state.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MessageAck {
            message_id: format!("LOOPBACK{:08}", id),
        })
    }

    async fn list_groups(&self) -> Result<Vec<GroupInfo>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(lock(&self.state.groups).clone())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Logout("connection already closed".to_string()));
        }
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Loopback connection for session {} closed", self.session_id);
        }
    }
}
