//! Session lifecycle orchestration for courier.
//!
//! This crate keeps a set of long-lived messaging sessions alive: it pairs
//! new identities, reconnects dropped transports with a capped linear
//! backoff, and runs one cyclic message campaign per session. Sessions
//! survive process restarts through the snapshot store of `courier-storage`.
//!
//! ## Features
//!
//! - **State machine**: INIT, PAIRED, CONNECTED, RECONNECTING, STOPPED with validated edges
//! - **Pairing**: code issued once per login through a take-once notifier
//! - **Reconnection**: linear backoff (2 s steps, 30 s cap), fixed fallback after connect errors
//! - **Dispatch**: cyclic campaigns with at most one send in flight per session
//! - **Restore**: silent reconnection of every persisted session at startup
//!
//! ## Example
//!
//! ```rust,no_run
//! use courier_session::{LoopbackOptions, LoopbackTransport, ServiceConfig, SessionService};
//! use courier_storage::Storage;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), courier_session::SessionError> {
//! let transport = Arc::new(LoopbackTransport::new(LoopbackOptions::automatic()));
//! let service = SessionService::new(Storage::in_memory(), transport, ServiceConfig::default());
//! service.restore().await?;
//!
//! let outcome = service.login("+49 151 1234567").await?;
//! println!("Session {}: {:?}", outcome.session_id, outcome.reply);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod loopback;
pub mod pairing;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod ticker;
pub mod transport;

// Re-export main types
pub use connection::{ConnectionConfig, ConnectionManager};
pub use error::{Result, SessionError, TransportError};
pub use loopback::{LoopbackOptions, LoopbackTransport, SentMessage};
pub use pairing::{format_pairing_code, normalize_phone_number, PairingNotifier, PairingReply};
pub use policy::{ReconnectionPolicy, RetryDecision};
pub use registry::{SessionPatch, SessionRegistry};
pub use scheduler::{CampaignQueue, MessageScheduler};
pub use service::{
    parse_interval, parse_messages, CampaignRequest, LoginOutcome, LoginReply, ServiceConfig,
    SessionService,
};
pub use ticker::{TickControl, Ticker};
pub use transport::{
    ConnectRequest, Connection, Destination, DisconnectReason, GroupInfo, MessageAck, Transport,
    TransportConfig, TransportEvent, TransportHandle,
};

pub use courier_storage::{Campaign, Credentials, Session, SessionId, SessionState};
