//! Error types for the session orchestrator.

use courier_storage::{SessionId, SessionState, StorageError};
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a transport provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("connect failed: {0}")]
    Connect(String),
    /// Connection establishment exceeded the configured timeout
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    /// A pairing code could not be obtained
    #[error("pairing failed: {0}")]
    Pairing(String),
    /// A message could not be dispatched
    #[error("send failed: {0}")]
    Send(String),
    /// A read-only query (e.g. group listing) failed
    #[error("query failed: {0}")]
    Query(String),
    /// Logging out of the network failed
    #[error("logout failed: {0}")]
    Logout(String),
    /// The handle was already closed
    #[error("transport closed")]
    Closed,
}

/// Caller-facing errors of the session orchestrator
#[derive(Error, Debug)]
pub enum SessionError {
    /// No session with this id exists (never created, or already stopped)
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// The session has no open transport
    #[error("session {0} is not connected")]
    NotConnected(SessionId),
    /// The state machine has no such edge
    #[error("session {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Session concerned
        id: SessionId,
        /// Current state
        from: SessionState,
        /// Requested state
        to: SessionState,
    },
    /// Phone number has no digits after normalization
    #[error("invalid phone number {0:?}")]
    InvalidPhoneNumber(String),
    /// Campaign request is unusable
    #[error("invalid campaign: {0}")]
    InvalidCampaign(String),
    /// Pairing code could not be generated
    #[error("pairing failed for session {id}: {reason}")]
    PairingFailed {
        /// Session concerned
        id: SessionId,
        /// Transport-provided reason
        reason: String,
    },
    /// Neither a pairing code nor a connection arrived in time
    #[error("no pairing outcome for session {0} in time")]
    PairingTimeout(SessionId),
    /// Transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Persistence failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result alias for session operations
pub type Result<T, E = SessionError> = std::result::Result<T, E>;
