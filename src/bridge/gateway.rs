//! Request gateway: connection to request exchange.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use super::{CloseReason, Frame, InboundError, Outbound};
use crate::bus::{Broker, Topology};
use crate::envelope::{self, Envelope, MessageType, RoutedRequest};
use crate::session::Session;

/// Reads client frames, gates them, and publishes routed requests.
pub struct Gateway {
    broker: Arc<dyn Broker>,
    topology: Topology,
    read_timeout: Duration,
}

impl Gateway {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, read_timeout: Duration) -> Self {
        Self {
            broker,
            topology,
            read_timeout,
        }
    }

    /// Loop until the connection closes, fails, or stays silent past the
    /// read deadline.
    pub async fn run<S>(&self, session: &Session, inbound: &mut S, outbound: &Outbound) -> CloseReason
    where
        S: Stream<Item = Result<Frame, InboundError>> + Send + Unpin,
    {
        let identifier = session.identifier();
        loop {
            let frame = match tokio::time::timeout(self.read_timeout, inbound.next()).await {
                Err(_) => {
                    info!(identifier = %identifier, "Read deadline expired");
                    return CloseReason::ReadTimeout;
                }
                Ok(None) => {
                    debug!(identifier = %identifier, "Peer closed connection");
                    return CloseReason::PeerClosed;
                }
                Ok(Some(Err(e))) => {
                    warn!(identifier = %identifier, error = %e, "Connection read failed");
                    return CloseReason::ReadError;
                }
                Ok(Some(Ok(Frame::KeepAlive))) => continue,
                Ok(Some(Ok(Frame::Data(bytes)))) => bytes,
            };

            if let Some(reply) = self.handle_frame(session, &frame).await {
                if !outbound.send_envelope(&reply).await {
                    return CloseReason::PeerClosed;
                }
            }
        }
    }

    /// Route one frame. Returns an envelope to send straight back to the
    /// client when the frame is rejected.
    pub async fn handle_frame(&self, session: &Session, frame: &[u8]) -> Option<Envelope> {
        let identifier = session.identifier();

        let tag = match envelope::peek_type(frame) {
            Ok(tag) => tag,
            Err(e) => {
                debug!(identifier = %identifier, error = %e, "Rejecting malformed frame");
                return Some(Envelope::error(format!("Invalid message: {}", e)));
            }
        };

        let kind = match MessageType::parse(&tag) {
            Some(MessageType::Request(kind)) => kind,
            Some(MessageType::Auth | MessageType::Error | MessageType::Response(_)) => {
                return Some(Envelope::error(format!("Unsupported message type: {}", tag)));
            }
            None => {
                debug!(identifier = %identifier, message_type = %tag, "Unknown message type");
                return Some(Envelope::error(format!("Unknown message type: {}", tag)));
            }
        };

        if kind.requires_authentication() && !session.is_authenticated() {
            warn!(identifier = %identifier, message_type = %tag, "Unauthorized request");
            return Some(Envelope::error(format!(
                "Unauthorized request: {} requires authentication",
                tag
            )));
        }

        let routed = match envelope::decode_as(MessageType::Request(kind), frame)
            .and_then(|request| {
                RoutedRequest::new(identifier.as_str(), session.subject_id(), &request)
            }) {
            Ok(routed) => routed,
            Err(e) => return Some(Envelope::error(format!("Invalid message: {}", e))),
        };

        if let Err(e) = self
            .broker
            .publish(&self.topology.request_direct, kind.as_str(), &routed.encode())
            .await
        {
            error!(identifier = %identifier, routing_key = %kind, error = %e, "Failed to publish request");
            return Some(Envelope::error(format!("Failed to route request: {}", kind)));
        }

        debug!(identifier = %identifier, routing_key = %kind, "Request published");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelBroker, QueueOptions};
    use crate::session::{Authentication, SessionManager};
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        broker: ChannelBroker,
        gateway: Gateway,
        manager: SessionManager,
    }

    async fn fixture() -> Fixture {
        let broker = ChannelBroker::new();
        let topology = Topology::default();
        topology.declare(&broker).await.unwrap();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        Fixture {
            gateway: Gateway::new(Arc::clone(&shared), topology.clone(), Duration::from_secs(5)),
            manager: SessionManager::new(shared, topology, CancellationToken::new()),
            broker,
        }
    }

    fn error_text(reply: Option<Envelope>) -> String {
        match reply {
            Some(Envelope::Error(frame)) => frame.error,
            other => panic!("expected error envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unauthenticated_gated_request_not_published() {
        let f = fixture().await;
        let session = f.manager.open(Authentication::Anonymous).await.unwrap();

        let reply = f.gateway.handle_frame(&session, br#"{"type":"get_users"}"#).await;

        assert_eq!(
            error_text(reply),
            "Unauthorized request: get_users requires authentication"
        );
        assert_eq!(f.broker.published_count(), 0);
    }

    #[tokio::test]
    async fn test_public_request_published_with_identifier() {
        let f = fixture().await;
        f.broker
            .declare_queue("probe", QueueOptions::durable())
            .await
            .unwrap();
        f.broker
            .bind_queue("probe", "login", "request-direct")
            .await
            .unwrap();
        let mut probe = f.broker.consume("probe").await.unwrap();
        let session = f.manager.open(Authentication::Anonymous).await.unwrap();

        let reply = f
            .gateway
            .handle_frame(
                &session,
                br#"{"type":"login_request","username":"alice","password":"secret1"}"#,
            )
            .await;
        assert!(reply.is_none());

        let body = probe.next().await.unwrap().unwrap();
        let routed = RoutedRequest::decode(&body).unwrap();
        assert_eq!(routed.identifier, session.identifier().as_str());
        assert_eq!(routed.request_type, "login");
        assert_eq!(routed.subject_id, None);
    }

    #[tokio::test]
    async fn test_rejections() {
        let f = fixture().await;
        let session = f
            .manager
            .open(Authentication::Authenticated { subject_id: 1 })
            .await
            .unwrap();

        let unknown = f.gateway.handle_frame(&session, br#"{"type":"nope"}"#).await;
        assert_eq!(error_text(unknown), "Unknown message type: nope");

        let response = f
            .gateway
            .handle_frame(&session, br#"{"type":"get_users_response"}"#)
            .await;
        assert_eq!(
            error_text(response),
            "Unsupported message type: get_users_response"
        );

        let malformed = f.gateway.handle_frame(&session, b"{").await;
        assert!(error_text(malformed).starts_with("Invalid message:"));

        let bad_payload = f
            .gateway
            .handle_frame(&session, br#"{"type":"get_messages"}"#)
            .await;
        assert!(error_text(bad_payload).starts_with("Invalid message:"));

        assert_eq!(f.broker.published_count(), 0);
    }
}
