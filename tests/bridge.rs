//! Correlation bridge integration tests over the in-process broker.
//!
//! Run with: cargo test --test bridge
//!
//! Each client is a pair of channels standing in for a socket: frames pushed
//! into the inbound sender reach the request gateway, and everything the
//! notification router forwards arrives on the outbound receiver.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use courier::bridge::{authenticate, Bridge, BridgeOptions, CloseReason, Frame, InboundError, Outbound};
use courier::bus::{Broker, ChannelBroker, QueueOptions, Topology};
use courier::domain::{
    Authenticator, Identity, InMemoryMessageStore, InMemoryUserStore, JwtAuthenticator,
    Sha256PasswordHasher,
};
use courier::session::{Authentication, Identifier, SessionManager};
use courier::worker::{message_handlers, user_handlers, WorkerPool};

const SECRET: &str = "bridge-test-secret";

type InboundSender = mpsc::UnboundedSender<Result<Frame, InboundError>>;
type InboundStream = UnboundedReceiverStream<Result<Frame, InboundError>>;

struct Harness {
    broker: ChannelBroker,
    shared: Arc<dyn Broker>,
    topology: Topology,
    manager: SessionManager,
    bridge: Bridge,
    root: CancellationToken,
    authenticator: Arc<JwtAuthenticator>,
    users: Arc<InMemoryUserStore>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_read_timeout(Duration::from_secs(30)).await
    }

    async fn with_read_timeout(read_timeout: Duration) -> Self {
        let broker = ChannelBroker::new();
        let topology = Topology::default();
        topology
            .declare(&broker)
            .await
            .expect("Failed to declare topology");
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());
        let root = CancellationToken::new();

        Self {
            manager: SessionManager::new(Arc::clone(&shared), topology.clone(), root.clone()),
            bridge: Bridge::new(
                Arc::clone(&shared),
                topology.clone(),
                BridgeOptions { read_timeout },
            ),
            broker,
            shared,
            topology,
            root,
            authenticator: Arc::new(JwtAuthenticator::new(SECRET, 3600)),
            users: Arc::new(InMemoryUserStore::new()),
        }
    }

    /// Start both worker pools over the harness broker.
    async fn start_workers(&self) -> WorkerPool {
        let mut handlers = user_handlers(
            self.users.clone(),
            Arc::new(Sha256PasswordHasher),
            self.authenticator.clone(),
        );
        handlers.extend(message_handlers(Arc::new(InMemoryMessageStore::new())));
        WorkerPool::start(
            Arc::clone(&self.shared),
            self.topology.clone(),
            handlers,
            self.root.child_token(),
        )
        .await
        .expect("Failed to start workers")
    }

    async fn connect(&self, authentication: Authentication) -> Client {
        let (inbound, stream) = inbound_pair();
        let session = self
            .manager
            .open(authentication)
            .await
            .expect("Failed to open session");
        self.run(session, inbound, stream)
    }

    /// Run the auth handshake with `token`, then bridge the session.
    async fn connect_with_token(&self, token: &str) -> Client {
        let (inbound, mut stream) = inbound_pair();
        send_frame(&inbound, &json!({"type": "auth", "token": token}));

        let identity = authenticate(&mut stream, self.authenticator.as_ref(), Duration::from_secs(1))
            .await
            .expect("Handshake failed");
        let session = self
            .manager
            .open(Authentication::Authenticated {
                subject_id: identity.user_id,
            })
            .await
            .expect("Failed to open session");
        self.run(session, inbound, stream)
    }

    fn run(
        &self,
        session: courier::session::Session,
        inbound: InboundSender,
        stream: InboundStream,
    ) -> Client {
        let identifier = session.identifier().to_string();
        let (outbound, outbound_rx) = Outbound::channel(64);
        let bridge = self.bridge.clone();
        let task = tokio::spawn(async move { bridge.run(session, stream, outbound).await });
        Client {
            identifier,
            inbound: Some(inbound),
            outbound: outbound_rx,
            task,
        }
    }

    async fn token_for(&self, user_id: u64, username: &str) -> String {
        self.users.insert(user_id, username, "unused").await;
        self.authenticator
            .issue(&Identity {
                user_id,
                username: username.to_string(),
            })
            .await
            .expect("Failed to issue token")
    }
}

fn inbound_pair() -> (InboundSender, InboundStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

fn send_frame(inbound: &InboundSender, value: &Value) {
    inbound
        .send(Ok(Frame::Data(value.to_string().into_bytes())))
        .expect("Bridge stopped reading");
}

struct Client {
    identifier: String,
    inbound: Option<InboundSender>,
    outbound: mpsc::Receiver<Vec<u8>>,
    task: JoinHandle<CloseReason>,
}

impl Client {
    fn send(&self, value: Value) {
        send_frame(self.inbound.as_ref().expect("Client already closed"), &value);
    }

    async fn recv(&mut self) -> Option<Value> {
        tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .ok()
            .flatten()
            .map(|bytes| serde_json::from_slice(&bytes).expect("Outbound frame is not JSON"))
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(150), self.outbound.recv()).await;
        if let Ok(Some(bytes)) = next {
            panic!("unexpected frame: {}", String::from_utf8_lossy(&bytes));
        }
    }

    /// Close from the client side and wait for the bridge to finish.
    async fn close(mut self) -> CloseReason {
        self.inbound.take();
        self.finished().await
    }

    async fn finished(self) -> CloseReason {
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("Bridge did not stop")
            .expect("Bridge task panicked")
    }
}

fn authenticated(subject_id: u64) -> Authentication {
    Authentication::Authenticated { subject_id }
}

fn self_response(id: u64, username: &str) -> Value {
    json!({"type": "get_self_response", "data": {"user": {"id": id, "username": username}}})
}

// ============================================================================
// Isolation and broadcast
// ============================================================================

#[tokio::test]
async fn test_direct_notifications_are_isolated() {
    let harness = Harness::new().await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(harness.connect(Authentication::Anonymous).await);
    }

    for (i, client) in clients.iter().enumerate() {
        let body = self_response(i as u64, "u").to_string();
        harness
            .broker
            .publish(&harness.topology.notify_direct, &client.identifier, body.as_bytes())
            .await
            .expect("Publish failed");
    }

    for (i, client) in clients.iter_mut().enumerate() {
        assert_eq!(client.recv().await, Some(self_response(i as u64, "u")));
        client.expect_silence().await;
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_open_session_once() {
    let harness = Harness::new().await;
    let mut a = harness.connect(authenticated(1)).await;
    let mut b = harness.connect(authenticated(2)).await;
    let closed = harness.connect(authenticated(3)).await;
    closed.close().await;

    let body = json!({"type": "get_users_response", "data": {"users": []}});
    harness
        .broker
        .publish(&harness.topology.notify_broadcast, "", body.to_string().as_bytes())
        .await
        .expect("Publish failed");

    for client in [&mut a, &mut b] {
        assert_eq!(client.recv().await, Some(body.clone()));
        client.expect_silence().await;
    }
}

#[tokio::test]
async fn test_anonymous_sessions_never_see_broadcasts() {
    let harness = Harness::new().await;
    let mut anonymous = harness.connect(Authentication::Anonymous).await;
    let mut member = harness.connect(authenticated(1)).await;

    // A queue minted for the HTTP flow, not attached yet.
    let pending = Identifier::new();
    harness
        .manager
        .provision(&pending, Authentication::Anonymous)
        .await
        .expect("Provision failed");

    let secret = json!({
        "type": "send_message_response",
        "data": {"message": {"id": 1, "sender_id": 1, "receiver_id": 2, "content": "secret"}}
    });
    for _ in 0..3 {
        harness
            .broker
            .publish(&harness.topology.notify_broadcast, "", secret.to_string().as_bytes())
            .await
            .expect("Publish failed");
    }

    for _ in 0..3 {
        assert_eq!(member.recv().await, Some(secret.clone()));
    }
    anonymous.expect_silence().await;

    let (inbound, stream) = inbound_pair();
    let session = harness.manager.attach(pending).await.expect("Attach failed");
    let mut attached = harness.run(session, inbound, stream);
    attached.expect_silence().await;
}

#[tokio::test]
async fn test_undecodable_notification_is_skipped() {
    let harness = Harness::new().await;
    let mut client = harness.connect(Authentication::Anonymous).await;

    for body in [b"garbage".as_slice(), br#"{"no_type":1}"#.as_slice()] {
        harness
            .broker
            .publish(&harness.topology.notify_direct, &client.identifier, body)
            .await
            .expect("Publish failed");
    }
    let valid = self_response(1, "a");
    harness
        .broker
        .publish(
            &harness.topology.notify_direct,
            &client.identifier,
            valid.to_string().as_bytes(),
        )
        .await
        .expect("Publish failed");

    assert_eq!(client.recv().await, Some(valid));
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_concurrent_close_deletes_queue_once() {
    let harness = Harness::new().await;
    let session = harness
        .manager
        .open(Authentication::Anonymous)
        .await
        .expect("Failed to open session");
    let queue = session.queue_name().to_string();
    let handles: Vec<_> = (0..4).map(|_| session.close_handle()).collect();

    let results = futures::future::join_all(handles.iter().map(|h| h.close())).await;
    let again = session.close().await;

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    assert!(!again);
    assert_eq!(harness.broker.delete_calls(&queue), 1);
}

#[tokio::test]
async fn test_peer_close_tears_down_once() {
    let harness = Harness::new().await;
    let client = harness.connect(Authentication::Anonymous).await;
    let queue = client.identifier.clone();

    assert_eq!(client.close().await, CloseReason::PeerClosed);
    assert_eq!(harness.broker.delete_calls(&queue), 1);
    assert_eq!(harness.broker.binding_count(&queue), 0);
    assert!(harness.broker.queue_names().is_empty());
}

#[tokio::test]
async fn test_no_queue_leaks_across_close_paths() {
    let harness = Harness::with_read_timeout(Duration::from_millis(200)).await;

    let peer_closed = harness.connect(Authentication::Anonymous).await;
    let read_error = harness.connect(Authentication::Anonymous).await;
    let timed_out = harness.connect(Authentication::Anonymous).await;

    assert_eq!(peer_closed.close().await, CloseReason::PeerClosed);

    read_error
        .inbound
        .as_ref()
        .expect("open")
        .send(Err(InboundError::Read("reset by peer".to_string())))
        .expect("Bridge stopped reading");
    assert_eq!(read_error.finished().await, CloseReason::ReadError);

    assert_eq!(timed_out.finished().await, CloseReason::ReadTimeout);

    let mut cancelled = Vec::new();
    for _ in 0..3 {
        cancelled.push(harness.connect(Authentication::Anonymous).await);
    }
    harness.root.cancel();
    for client in cancelled {
        assert_eq!(client.finished().await, CloseReason::Cancelled);
    }

    assert!(harness.broker.queue_names().is_empty());
}

#[tokio::test]
async fn test_externally_deleted_queue_ends_session() {
    let harness = Harness::new().await;
    let client = harness.connect(Authentication::Anonymous).await;

    harness
        .broker
        .delete_queue(&client.identifier)
        .await
        .expect("Delete failed");

    assert_eq!(client.finished().await, CloseReason::ConnectionLost);
}

// ============================================================================
// Request gateway
// ============================================================================

#[tokio::test]
async fn test_authorization_gate_blocks_before_publish() {
    let harness = Harness::new().await;
    harness
        .broker
        .declare_queue("probe", QueueOptions::durable())
        .await
        .expect("Declare failed");
    harness
        .broker
        .bind_queue("probe", "get_self", &harness.topology.request_direct)
        .await
        .expect("Bind failed");
    let mut probe = harness.broker.consume("probe").await.expect("Consume failed");

    let mut client = harness.connect(Authentication::Anonymous).await;
    client.send(json!({"type": "get_self"}));

    assert_eq!(
        client.recv().await,
        Some(json!({
            "type": "error",
            "error": "Unauthorized request: get_self requires authentication"
        }))
    );
    let leaked = tokio::time::timeout(Duration::from_millis(150), futures::StreamExt::next(&mut probe)).await;
    assert!(leaked.is_err(), "gated request reached the request exchange");
}

#[tokio::test]
async fn test_unknown_type_keeps_connection_open() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let token = harness.token_for(7, "alice").await;
    let mut client = harness.connect_with_token(&token).await;

    client.send(json!({"type": "doSomethingUnknown"}));
    assert_eq!(
        client.recv().await,
        Some(json!({"type": "error", "error": "Unknown message type: doSomethingUnknown"}))
    );

    client.send(json!({"type": "get_self"}));
    assert_eq!(client.recv().await, Some(self_response(7, "alice")));
}

// ============================================================================
// Round trips through the workers
// ============================================================================

#[tokio::test]
async fn test_get_self_round_trip() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let token = harness.token_for(7, "alice").await;
    let mut client = harness.connect_with_token(&token).await;

    client.send(json!({"type": "get_self"}));

    assert_eq!(client.recv().await, Some(self_response(7, "alice")));
    client.expect_silence().await;
}

#[tokio::test]
async fn test_worker_domain_failure_is_answered() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let token = harness
        .authenticator
        .issue(&Identity {
            user_id: 99,
            username: "ghost".to_string(),
        })
        .await
        .expect("Failed to issue token");
    let mut client = harness.connect_with_token(&token).await;

    client.send(json!({"type": "get_self"}));

    assert_eq!(
        client.recv().await,
        Some(json!({"type": "get_self_response", "error": "user 99 not found"}))
    );
}

#[tokio::test]
async fn test_malformed_worker_input_gets_no_response() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let token = harness.token_for(7, "alice").await;
    let mut client = harness.connect_with_token(&token).await;

    let garbage = json!({"identifier": client.identifier, "type": "get_self", "payload": 5});
    harness
        .broker
        .publish(
            &harness.topology.request_direct,
            "get_self",
            garbage.to_string().as_bytes(),
        )
        .await
        .expect("Publish failed");
    client.expect_silence().await;

    client.send(json!({"type": "get_self"}));
    assert_eq!(client.recv().await, Some(self_response(7, "alice")));
}

#[tokio::test]
async fn test_send_message_is_broadcast() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let alice_token = harness.token_for(1, "alice").await;
    let bob_token = harness.token_for(2, "bob").await;
    let mut alice = harness.connect_with_token(&alice_token).await;
    let mut bob = harness.connect_with_token(&bob_token).await;

    alice.send(json!({"type": "send_message", "receiver_id": 2, "content": "hi bob"}));

    let expected = json!({
        "type": "send_message_response",
        "data": {"message": {"id": 1, "sender_id": 1, "receiver_id": 2, "content": "hi bob"}}
    });
    assert_eq!(alice.recv().await, Some(expected.clone()));
    assert_eq!(bob.recv().await, Some(expected));

    bob.send(json!({"type": "get_messages", "receiver_id": 1}));
    let history = bob.recv().await.expect("No get_messages response");
    assert_eq!(history["type"], "get_messages_response");
    assert_eq!(history["data"]["messages"][0]["content"], "hi bob");
}

#[tokio::test]
async fn test_anonymous_registration_round_trip() {
    let harness = Harness::new().await;
    let _workers = harness.start_workers().await;
    let mut client = harness.connect(Authentication::Anonymous).await;

    client.send(json!({"type": "registration", "username": "carol", "password": "secret1"}));

    let response = client.recv().await.expect("No registration response");
    assert_eq!(response["type"], "registration_response");
    assert_eq!(response["data"]["user"]["username"], "carol");

    client.send(json!({"type": "login_request", "username": "carol", "password": "secret1"}));
    let response = client.recv().await.expect("No login response");
    assert_eq!(response["type"], "login_response");
    let token = response["data"]["token"].as_str().expect("token");
    let identity = harness
        .authenticator
        .validate(token)
        .await
        .expect("Issued token is invalid");
    assert_eq!(identity.username, "carol");
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_failed_handshake_declares_no_queue() {
    let harness = Harness::new().await;
    let (inbound, mut stream) = inbound_pair();
    send_frame(&inbound, &json!({"type": "auth", "token": "forged"}));

    let result = authenticate(
        &mut stream,
        harness.authenticator.as_ref(),
        Duration::from_secs(1),
    )
    .await;

    assert!(result.is_err());
    assert!(harness.broker.queue_names().is_empty());
}
