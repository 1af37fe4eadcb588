//! Session capability interface.
//!
//! The gateway client itself is an external collaborator — the supervisor
//! only needs login, destroy, a connected-probe, and the event stream.
//! Session kinds are handled inside the connector (privileged sessions
//! subscribe to the full event intents, constrained ones run a reduced
//! cache profile); from here on a session is opaque.

use std::sync::Arc;

use {
    async_trait::async_trait,
    courier_common::types::RelayMessage,
    courier_config::AccountDesiredState,
    courier_relay::HistoryReader,
    tokio::sync::mpsc,
};

/// Events surfaced by a live session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Login completed; carries the session's own account identity.
    Ready { self_id: String },
    /// One observed message.
    Message(RelayMessage),
    /// The gateway connection resumed after a transient drop.
    Resume,
    /// Non-fatal session error.
    Error(String),
    /// The session lost its connection and will not recover on its own.
    Disconnect { reason: String },
}

/// Login/connect failure classification.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The credential was rejected. Terminal: no amount of retrying helps.
    #[error("credential rejected: {0}")]
    CredentialInvalid(String),
    /// Anything retriable (network, gateway unavailable, rate limits).
    #[error("connect failed: {0}")]
    Retriable(String),
}

impl ConnectError {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CredentialInvalid(_))
    }
}

/// Control surface of a live session.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Tear the session down. Idempotent.
    async fn destroy(&self);
    /// Connected-probe used as the reconnect race guard.
    fn is_connected(&self) -> bool;
}

/// A logged-in session: its event stream, control surface, and the
/// history access reply scans need.
pub struct SessionHandle {
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: Arc<dyn SessionControl>,
    pub history: Option<Arc<dyn HistoryReader>>,
}

/// Builds and logs in sessions. One connect call produces one fully
/// reconstructed session object; sessions are never resumed across
/// reconnect attempts.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, desired: &AccountDesiredState) -> Result<SessionHandle, ConnectError>;
}
