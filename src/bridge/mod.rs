//! Correlation bridge between one connection and the broker.
//!
//! For every open session the bridge runs two concurrent loops:
//! - the notification router, draining the session queue into the connection
//! - the request gateway, publishing the connection's requests to the workers
//!
//! The connection itself is abstracted as a stream of inbound [`Frame`]s and
//! an [`Outbound`] byte channel, so the same bridge serves WebSockets and
//! in-memory test harnesses.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::bus::{Broker, Topology};
use crate::envelope::Envelope;
use crate::session::Session;

pub mod gateway;
pub mod handshake;
pub mod router;

pub use gateway::Gateway;
pub use handshake::{authenticate, HandshakeError};
pub use router::RouterExit;

/// Default inbound read deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// One unit read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text or binary payload.
    Data(Vec<u8>),
    /// Liveness traffic (pong) that carries no payload but resets the read deadline.
    KeepAlive,
}

/// Errors reading from the connection.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("connection read failed: {0}")]
    Read(String),
}

/// Why a bridged session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    PeerClosed,
    /// Reading from the connection failed.
    ReadError,
    /// No frame arrived within the read deadline.
    ReadTimeout,
    /// The session token was cancelled (process shutdown or explicit close).
    Cancelled,
    /// The session queue could not be consumed or its stream ended.
    ConnectionLost,
}

/// Sending half of a connection.
///
/// Bytes pushed here are written to the socket verbatim by the connection's
/// writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Outbound {
    pub fn new(tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { tx }
    }

    /// Bounded channel pair; the receiver feeds the socket writer.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Returns `false` once the writer has gone away.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).await.is_ok()
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send_raw(envelope.encode()).await
    }
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub read_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Runs the router and gateway for open sessions.
#[derive(Clone)]
pub struct Bridge {
    broker: Arc<dyn Broker>,
    topology: Topology,
    options: BridgeOptions,
}

impl Bridge {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, options: BridgeOptions) -> Self {
        Self {
            broker,
            topology,
            options,
        }
    }

    /// Bridge `session` until the connection ends or the session is
    /// cancelled, then tear the session down.
    pub async fn run<S>(&self, session: Session, mut inbound: S, outbound: Outbound) -> CloseReason
    where
        S: Stream<Item = Result<Frame, InboundError>> + Send + Unpin,
    {
        let identifier = session.identifier().clone();
        let cancel = session.cancellation().clone();

        let messages = match self.broker.consume(session.queue_name()).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Failed to consume session queue");
                outbound
                    .send_envelope(&Envelope::error("Failed to subscribe to notifications"))
                    .await;
                session.close().await;
                return CloseReason::ConnectionLost;
            }
        };

        let router = tokio::spawn(router::run(
            identifier.clone(),
            messages,
            outbound.clone(),
            cancel.clone(),
        ));

        let gateway = Gateway::new(
            Arc::clone(&self.broker),
            self.topology.clone(),
            self.options.read_timeout,
        );

        let mut reason = tokio::select! {
            reason = gateway.run(&session, &mut inbound, &outbound) => reason,
            _ = cancel.cancelled() => CloseReason::Cancelled,
        };

        session.close().await;

        let exit = match router.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Notification router task failed");
                RouterExit::StreamEnded
            }
        };
        if reason == CloseReason::Cancelled && exit == RouterExit::StreamEnded {
            reason = CloseReason::ConnectionLost;
        }

        info!(identifier = %identifier, reason = ?reason, "Bridge finished");
        reason
    }
}
