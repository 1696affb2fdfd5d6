//! Capability surface of the messaging transport.
//!
//! The wire protocol and cryptographic handshake live in a transport
//! provider outside this crate. The orchestrator only needs to open a
//! connection with stored credential material, observe its lifecycle
//! events, and use the resulting handle for pairing, dispatch and
//! read-only queries.

use crate::error::TransportError;
use async_trait::async_trait;
use courier_storage::{Credentials, SessionId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Suffix marking a group destination
pub const GROUP_SUFFIX: &str = "@g.us";
/// Suffix appended to a bare number to address a direct chat
pub const DIRECT_SUFFIX: &str = "@s.whatsapp.net";

/// Why the transport closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Identity was logged out remotely (permanent revocation)
    LoggedOut,
    /// Server closed the connection
    ConnectionClosed,
    /// Connection dropped or timed out
    ConnectionLost,
    /// Another client took over the identity
    ConnectionReplaced,
    /// Server asked for a fresh connection (e.g. right after pairing)
    RestartRequired,
    /// Any other status code, treated as transient
    Other(u16),
}

impl DisconnectReason {
    /// Map a provider status code onto a reason
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            428 => DisconnectReason::ConnectionClosed,
            408 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            515 => DisconnectReason::RestartRequired,
            other => DisconnectReason::Other(other),
        }
    }

    /// Status code as reported by the provider
    pub fn status_code(self) -> u16 {
        match self {
            DisconnectReason::LoggedOut => 401,
            DisconnectReason::ConnectionClosed => 428,
            DisconnectReason::ConnectionLost => 408,
            DisconnectReason::ConnectionReplaced => 440,
            DisconnectReason::RestartRequired => 515,
            DisconnectReason::Other(code) => code,
        }
    }

    /// Whether the identity itself was revoked
    pub fn is_permanent_revocation(self) -> bool {
        self == DisconnectReason::LoggedOut
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Other(code) => write!(f, "status {}", code),
            reason => write!(f, "{:?} ({})", reason, reason.status_code()),
        }
    }
}

/// Lifecycle events emitted by a live connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Transport is open and usable
    Open,
    /// Transport closed
    Close(DisconnectReason),
    /// Provider rotated credential material; must be persisted
    CredentialsUpdated(Credentials),
}

/// Resolved dispatch destination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Group chat, addressed by its group id
    Group(String),
    /// Direct chat with a single identity
    Direct(String),
}

impl Destination {
    /// Targets already carrying the group suffix are groups; anything else
    /// is treated as a bare number and gets the direct suffix.
    pub fn resolve(target: &str) -> Self {
        let target = target.trim();
        if target.ends_with(GROUP_SUFFIX) {
            Destination::Group(target.to_string())
        } else if target.ends_with(DIRECT_SUFFIX) {
            Destination::Direct(target.to_string())
        } else {
            Destination::Direct(format!("{}{}", target, DIRECT_SUFFIX))
        }
    }

    /// Fully-qualified address
    pub fn address(&self) -> &str {
        match self {
            Destination::Group(address) | Destination::Direct(address) => address,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

/// Acknowledgement of a dispatched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAck {
    /// Provider-assigned message id
    pub message_id: String,
}

/// Group the identity participates in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    /// Human-readable subject
    pub name: String,
    /// Group id (carries the group suffix)
    pub id: String,
}

/// Fixed connection parameters handed to the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Upper bound for connection establishment
    pub connect_timeout: Duration,
    /// Keep-alive ping interval
    pub keepalive_interval: Duration,
    /// Client name announced to the network
    pub client_name: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(120),
            keepalive_interval: Duration::from_secs(10),
            client_name: "courier".to_string(),
        }
    }
}

/// Everything a provider needs to open one session's connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Session the connection belongs to
    pub session_id: SessionId,
    /// Previously persisted credential material, if any
    pub credentials: Option<Credentials>,
    /// Connection parameters
    pub config: TransportConfig,
}

/// A freshly opened connection: the handle plus its event stream
pub struct Connection {
    /// Live connection object
    pub handle: Arc<dyn TransportHandle>,
    /// Lifecycle events; dropping the receiver unsubscribes
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("handle", &self.handle).finish()
    }
}

/// Transport provider
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection
    async fn connect(&self, request: ConnectRequest) -> Result<Connection, TransportError>;
}

/// Live connection of one session
#[async_trait]
pub trait TransportHandle: Send + Sync + fmt::Debug {
    /// Whether the identity behind the credentials is already registered
    fn is_registered(&self) -> bool;

    /// Ask the network for a pairing code for a digits-only number
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError>;

    /// Dispatch a text message
    async fn send_message(
        &self,
        destination: &Destination,
        content: &str,
    ) -> Result<MessageAck, TransportError>;

    /// Groups the identity participates in
    async fn list_groups(&self) -> Result<Vec<GroupInfo>, TransportError>;

    /// Log the identity out of the network
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the connection without logging out
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_resolution() {
        assert_eq!(
            Destination::resolve("120363025246125888@g.us"),
            Destination::Group("120363025246125888@g.us".to_string())
        );
        assert_eq!(
            Destination::resolve("4915112345678"),
            Destination::Direct("4915112345678@s.whatsapp.net".to_string())
        );
        assert_eq!(
            Destination::resolve("4915112345678@s.whatsapp.net").address(),
            "4915112345678@s.whatsapp.net"
        );
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::from_status_code(401), DisconnectReason::LoggedOut);
        assert_eq!(DisconnectReason::from_status_code(515), DisconnectReason::RestartRequired);
        assert_eq!(DisconnectReason::from_status_code(0), DisconnectReason::Other(0));
        assert!(DisconnectReason::LoggedOut.is_permanent_revocation());
        assert!(!DisconnectReason::ConnectionReplaced.is_permanent_revocation());
        for code in [401, 428, 408, 440, 515, 503] {
            assert_eq!(DisconnectReason::from_status_code(code).status_code(), code);
        }
    }
}
