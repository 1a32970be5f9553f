//! Per-connection session state.
//!
//! A session owns one ephemeral broker queue named by its identifier. The
//! queue is bound to the direct notification exchange under the identifier
//! and to the broadcast exchange. Teardown (unbind, delete, cancel) runs
//! exactly once no matter how many paths race to close the session.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Broker, BusError, Topology};

pub mod manager;

pub use manager::{Authentication, SessionManager};

/// Errors that can occur while opening a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Broker error: {0}")]
    Bus(#[from] BusError),

    #[error("No queue exists for identifier {0}")]
    QueueNotFound(Identifier),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

/// Opaque per-connection token: routing key and queue name at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier(String);

impl Identifier {
    /// Mint a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept only canonical UUID strings.
    pub fn parse(value: &str) -> Result<Self, SessionError> {
        Uuid::parse_str(value)
            .map(|uuid| Self(uuid.to_string()))
            .map_err(|_| SessionError::InvalidIdentifier(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Identifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Identifier {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session lifecycle. `Closed` is terminal.
///
/// A session is `Connecting` while its queue is provisioned and becomes
/// `Open` once the queue and its bindings exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Everything teardown needs, shareable between the tasks of one session.
struct Teardown {
    state: AtomicU8,
    identifier: Identifier,
    /// Whether the queue carries a broadcast binding to remove.
    broadcast: bool,
    broker: Arc<dyn Broker>,
    topology: Topology,
    cancel: CancellationToken,
}

impl Teardown {
    /// Drive `Open -> Closing -> Closed`. Returns `false` when another caller
    /// already won the latch.
    async fn close(&self) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Open as u8,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(identifier = %self.identifier, "Session already closing");
            return false;
        }

        let queue = self.identifier.as_str();

        // Unbind and delete before cancelling the router.
        if let Err(e) = self
            .broker
            .unbind_queue(queue, queue, &self.topology.notify_direct)
            .await
        {
            warn!(identifier = %self.identifier, error = %e, "Failed to unbind direct notifications");
        }
        if self.broadcast {
            if let Err(e) = self
                .broker
                .unbind_queue(queue, "", &self.topology.notify_broadcast)
                .await
            {
                warn!(identifier = %self.identifier, error = %e, "Failed to unbind broadcasts");
            }
        }
        if let Err(e) = self.broker.delete_queue(queue).await {
            warn!(identifier = %self.identifier, error = %e, "Failed to delete session queue");
        }

        self.cancel.cancel();
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);

        info!(identifier = %self.identifier, "Session closed");
        true
    }
}

/// A live connection's session.
///
/// Owned by the connection task. Its queue exists while the state is
/// `Open` or `Closing`.
pub struct Session {
    authenticated: bool,
    subject_id: Option<u64>,
    teardown: Arc<Teardown>,
}

impl Session {
    /// A `Connecting` session; [`Session::mark_open`] follows provisioning.
    pub(crate) fn new(
        identifier: Identifier,
        authentication: Authentication,
        broker: Arc<dyn Broker>,
        topology: Topology,
        cancel: CancellationToken,
    ) -> Self {
        let (authenticated, subject_id) = match authentication {
            Authentication::Anonymous => (false, None),
            Authentication::Authenticated { subject_id } => (true, Some(subject_id)),
        };

        Self {
            authenticated,
            subject_id,
            teardown: Arc::new(Teardown {
                state: AtomicU8::new(SessionState::Connecting as u8),
                identifier,
                broadcast: authenticated,
                broker,
                topology,
                cancel,
            }),
        }
    }

    /// `Connecting -> Open`. Returns `false` if the session was not connecting.
    pub(crate) fn mark_open(&self) -> bool {
        self.teardown
            .state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Provisioning failed: the session goes straight to `Closed`.
    pub(crate) fn mark_failed(&self) {
        self.teardown.cancel.cancel();
        self.teardown
            .state
            .store(SessionState::Closed as u8, Ordering::Release);
    }

    pub fn authentication(&self) -> Authentication {
        match self.subject_id {
            Some(subject_id) if self.authenticated => Authentication::Authenticated { subject_id },
            _ => Authentication::Anonymous,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.teardown.identifier
    }

    /// Queue name; equal to the identifier.
    pub fn queue_name(&self) -> &str {
        self.teardown.identifier.as_str()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn subject_id(&self) -> Option<u64> {
        self.subject_id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.teardown.state.load(Ordering::Acquire))
    }

    /// Cancellation token observed by the session's router and gateway.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.teardown.cancel
    }

    /// Tear the session down. Idempotent and safe to call concurrently;
    /// returns `true` only for the call that performed the teardown.
    pub async fn close(&self) -> bool {
        self.teardown.close().await
    }

    /// A cloneable handle that can close this session from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            teardown: Arc::clone(&self.teardown),
        }
    }
}

/// Cloneable closer for a [`Session`].
#[derive(Clone)]
pub struct CloseHandle {
    teardown: Arc<Teardown>,
}

impl CloseHandle {
    pub async fn close(&self) -> bool {
        self.teardown.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_is_uuid() {
        let id = Identifier::new();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_ne!(id, Identifier::new());
    }

    #[test]
    fn test_identifier_parse_rejects_garbage() {
        assert!(matches!(
            Identifier::parse("../etc"),
            Err(SessionError::InvalidIdentifier(_))
        ));
        let id = Identifier::new();
        assert_eq!(Identifier::parse(id.as_str()).unwrap(), id);
    }

    #[tokio::test]
    async fn test_session_starts_connecting() {
        let broker = crate::bus::ChannelBroker::new();
        let session = Session::new(
            Identifier::new(),
            Authentication::Anonymous,
            Arc::new(broker.clone()),
            Topology::default(),
            CancellationToken::new(),
        );
        assert_eq!(session.state(), SessionState::Connecting);

        // Nothing to tear down before the queue exists.
        assert!(!session.close().await);
        assert_eq!(broker.delete_calls(session.queue_name()), 0);

        assert!(session.mark_open());
        assert!(!session.mark_open());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            SessionState::Connecting,
            SessionState::Open,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }
}
