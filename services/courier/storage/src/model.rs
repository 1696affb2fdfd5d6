//! Persisted session model shared by the storage backends and the session crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Dispatch interval used when a campaign carries no usable interval
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Opaque session identifier (32 lowercase hex characters)
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random identifier from 16 random bytes
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier carries no characters at all
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Created, no connection attempt has completed yet
    Init,
    /// Pairing code issued, waiting for the user to confirm it
    Paired,
    /// Transport open and usable
    Connected,
    /// Transport closed, retry scheduled
    Reconnecting,
    /// Terminal, no further connection attempts
    Stopped,
}

impl SessionState {
    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// Edges: INIT→PAIRED, INIT/PAIRED/RECONNECTING→CONNECTED,
    /// CONNECTED→RECONNECTING and any non-STOPPED state→STOPPED.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Paired)
                | (Init, Connected)
                | (Paired, Connected)
                | (Reconnecting, Connected)
                | (Connected, Reconnecting)
                | (Init, Stopped)
                | (Paired, Stopped)
                | (Connected, Stopped)
                | (Reconnecting, Stopped)
        )
    }

    /// Whether this is the terminal state
    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }

    /// Upper-case name as written to the snapshot file
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Init => "INIT",
            SessionState::Paired => "PAIRED",
            SessionState::Connected => "CONNECTED",
            SessionState::Reconnecting => "RECONNECTING",
            SessionState::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A configured repeating dispatch campaign
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    /// Destination (group id with the group suffix, or a bare number)
    pub target: String,
    /// Prefix prepended to every outgoing message
    pub label: String,
    /// Ordered messages, dispatched in a loop
    pub messages: Vec<String>,
    /// Index of the next message to send
    #[serde(default)]
    pub cursor: usize,
    /// Seconds between dispatch ticks (0 selects the default)
    #[serde(default)]
    pub interval_seconds: u64,
}

impl Campaign {
    /// Period between dispatch ticks
    pub fn interval(&self) -> Duration {
        let secs = if self.interval_seconds == 0 {
            DEFAULT_INTERVAL_SECS
        } else {
            self.interval_seconds
        };
        Duration::from_secs(secs)
    }

    /// Cursor clamped into `[0, len(messages))`, 0 for an empty list
    pub fn clamped_cursor(&self) -> usize {
        if self.messages.is_empty() {
            0
        } else {
            self.cursor % self.messages.len()
        }
    }
}

/// Central session entity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Registry primary key
    pub id: SessionId,
    /// Digits-only external identity
    pub phone_number: String,
    /// Current lifecycle state
    pub state: SessionState,
    /// Last-known transport openness, for reporting only
    #[serde(default)]
    pub connected: bool,
    /// Dispatch campaign, once configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<Campaign>,
    /// Consecutive reconnection attempts since the last open
    #[serde(default)]
    pub reconnect_attempts: u32,
    /// Time of the last state-affecting event
    pub last_update: DateTime<Utc>,
}

impl Session {
    /// Create a fresh session in the INIT state
    pub fn new(id: SessionId, phone_number: impl Into<String>) -> Self {
        Self {
            id,
            phone_number: phone_number.into(),
            state: SessionState::Init,
            connected: false,
            campaign: None,
            reconnect_attempts: 0,
            last_update: Utc::now(),
        }
    }

    /// Record that a state-affecting event just happened
    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

/// Whole-table snapshot, keyed by session id
pub type SessionSnapshot = BTreeMap<SessionId, Session>;
