//! Session provisioning.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Identifier, Session, SessionError};
use crate::bus::{Broker, BusError, QueueOptions, Topology};

/// Authentication outcome fixed before a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authentication {
    Anonymous,
    Authenticated { subject_id: u64 },
}

/// Creates sessions and their ephemeral queues.
///
/// Every session token is a child of the manager's root token, so cancelling
/// the root (process shutdown) cancels every live session.
#[derive(Clone)]
pub struct SessionManager {
    broker: Arc<dyn Broker>,
    topology: Topology,
    root: CancellationToken,
}

impl SessionManager {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, root: CancellationToken) -> Self {
        Self {
            broker,
            topology,
            root,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declare the identifier's queue and bind it to the direct notification
    /// exchange. Only authenticated sessions are also bound to the broadcast
    /// exchange. Idempotent. On failure the partially created queue is
    /// deleted best-effort.
    pub async fn provision(
        &self,
        identifier: &Identifier,
        authentication: Authentication,
    ) -> Result<(), SessionError> {
        let queue = identifier.as_str();
        let result = async {
            self.broker
                .declare_queue(queue, QueueOptions::ephemeral())
                .await?;
            self.broker
                .bind_queue(queue, queue, &self.topology.notify_direct)
                .await?;
            if let Authentication::Authenticated { .. } = authentication {
                self.broker
                    .bind_queue(queue, "", &self.topology.notify_broadcast)
                    .await?;
            }
            Ok::<(), BusError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(identifier = %identifier, error = %e, "Failed to provision session queue");
            if let Err(cleanup) = self.broker.delete_queue(queue).await {
                warn!(identifier = %identifier, error = %cleanup, "Failed to remove partial queue");
            }
            return Err(e.into());
        }

        info!(identifier = %identifier, "Session queue provisioned");
        Ok(())
    }

    /// Mint an identifier, provision its queue and open the session.
    pub async fn open(&self, authentication: Authentication) -> Result<Session, SessionError> {
        self.establish(Identifier::new(), authentication).await
    }

    /// Open an anonymous session over a queue provisioned earlier.
    pub async fn attach(&self, identifier: Identifier) -> Result<Session, SessionError> {
        if !self.broker.queue_exists(identifier.as_str()).await? {
            return Err(SessionError::QueueNotFound(identifier));
        }
        self.establish(identifier, Authentication::Anonymous).await
    }

    pub async fn queue_exists(&self, identifier: &Identifier) -> Result<bool, SessionError> {
        Ok(self.broker.queue_exists(identifier.as_str()).await?)
    }

    /// Drive a new session through `Connecting -> Open`.
    async fn establish(
        &self,
        identifier: Identifier,
        authentication: Authentication,
    ) -> Result<Session, SessionError> {
        let session = Session::new(
            identifier,
            authentication,
            Arc::clone(&self.broker),
            self.topology.clone(),
            self.root.child_token(),
        );

        if let Err(e) = self.provision(session.identifier(), authentication).await {
            session.mark_failed();
            return Err(e);
        }
        session.mark_open();

        info!(identifier = %session.identifier(), authentication = ?authentication, "Session opened");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelBroker;
    use crate::session::SessionState;
    use futures::StreamExt;

    async fn manager() -> (ChannelBroker, SessionManager) {
        let broker = ChannelBroker::new();
        let topology = Topology::default();
        topology.declare(&broker).await.unwrap();
        let manager = SessionManager::new(
            Arc::new(broker.clone()),
            topology,
            CancellationToken::new(),
        );
        (broker, manager)
    }

    #[tokio::test]
    async fn test_open_provisions_queue_and_bindings() {
        let (broker, manager) = manager().await;
        let session = manager
            .open(Authentication::Authenticated { subject_id: 7 })
            .await
            .unwrap();

        assert_eq!(broker.queue_names(), vec![session.queue_name().to_string()]);
        assert_eq!(broker.binding_count(session.queue_name()), 2);
        assert_eq!(session.subject_id(), Some(7));
        assert!(session.is_authenticated());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_anonymous_session_has_no_broadcast_binding() {
        let (broker, manager) = manager().await;
        let session = manager.open(Authentication::Anonymous).await.unwrap();

        assert_eq!(broker.binding_count(session.queue_name()), 1);
        assert_eq!(session.authentication(), Authentication::Anonymous);

        assert!(session.close().await);
        assert_eq!(broker.binding_count(session.queue_name()), 0);
    }

    #[tokio::test]
    async fn test_pending_queue_misses_broadcasts() {
        let (broker, manager) = manager().await;
        let identifier = Identifier::new();
        manager
            .provision(&identifier, Authentication::Anonymous)
            .await
            .unwrap();

        broker
            .publish("notify-broadcast", "", br#"{"type":"send_message_response"}"#)
            .await
            .unwrap();
        broker
            .publish("notify-direct", identifier.as_str(), br#"{"type":"login_response"}"#)
            .await
            .unwrap();

        let session = manager.attach(identifier).await.unwrap();
        let mut stream = broker.consume(session.queue_name()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, br#"{"type":"login_response"}"#.to_vec());
        let rest = tokio::time::timeout(std::time::Duration::from_millis(50), stream.next()).await;
        assert!(rest.is_err());
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let (broker, manager) = manager().await;
        let session = manager.open(Authentication::Anonymous).await.unwrap();
        let handle = session.close_handle();

        let (a, b) = tokio::join!(session.close(), handle.close());
        assert!(a ^ b);
        assert!(!session.close().await);

        assert_eq!(broker.delete_calls(session.queue_name()), 1);
        assert!(broker.queue_names().is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_attach_requires_existing_queue() {
        let (_broker, manager) = manager().await;
        let result = manager.attach(Identifier::new()).await;
        assert!(matches!(result, Err(SessionError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_attach_after_provision() {
        let (_broker, manager) = manager().await;
        let identifier = Identifier::new();
        manager
            .provision(&identifier, Authentication::Anonymous)
            .await
            .unwrap();

        let session = manager.attach(identifier.clone()).await.unwrap();
        assert_eq!(session.identifier(), &identifier);
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn test_provision_failure_removes_queue() {
        let broker = ChannelBroker::new();
        // No exchanges declared: binding fails after the queue is created.
        let manager = SessionManager::new(
            Arc::new(broker.clone()),
            Topology::default(),
            CancellationToken::new(),
        );

        let result = manager.open(Authentication::Anonymous).await;
        assert!(matches!(result, Err(SessionError::Bus(_))));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_root_cancellation_reaches_sessions() {
        let broker = ChannelBroker::new();
        let topology = Topology::default();
        topology.declare(&broker).await.unwrap();
        let root = CancellationToken::new();
        let manager = SessionManager::new(Arc::new(broker), topology, root.clone());

        let session = manager.open(Authentication::Anonymous).await.unwrap();
        root.cancel();
        assert!(session.cancellation().is_cancelled());
    }
}
