//! Worker consumers.
//!
//! One consumer per request type. Each consumer owns a durable queue
//! (`courier.requests.<type>`) bound to the request exchange under the type
//! name, hands every routed request to its [`RequestHandler`], and publishes
//! exactly one paired response back toward the requester.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{self, Broker, BusError, MessageStream, QueueOptions, Topology};
use crate::domain::DomainError;
use crate::envelope::{Envelope, RequestKind, RoutedRequest};

pub mod handlers;

pub use handlers::{
    message_handlers, user_handlers, GetMessagesHandler, GetSelfHandler, GetUsersHandler,
    LoginHandler, RegistrationHandler, SendMessageHandler,
};

/// Prefix of every worker queue name.
pub const QUEUE_PREFIX: &str = "courier.requests";

/// Maximum consecutive resubscribe attempts before a consumer gives up.
const MAX_RESUBSCRIBE_ATTEMPTS: usize = 10;

/// Durable queue name for a request type.
pub fn queue_name(kind: RequestKind) -> String {
    format!("{}.{}", QUEUE_PREFIX, kind)
}

/// Who asked, as carried on the routed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub identifier: String,
    pub subject_id: Option<u64>,
}

impl RequestContext {
    /// The authenticated subject, or `Unauthorized`.
    pub fn subject(&self) -> Result<u64, DomainError> {
        self.subject_id
            .ok_or_else(|| DomainError::Unauthorized("authentication required".to_string()))
    }
}

/// Domain capability behind one request type.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    fn kind(&self) -> RequestKind;

    /// Execute `request` and build its paired response. Domain failures are
    /// reported in the response, never by skipping it.
    async fn handle(&self, ctx: &RequestContext, request: Envelope) -> Envelope;
}

/// Outcome of processing one broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A response was published.
    Responded,
    /// The message was malformed and dropped without a response.
    Dropped,
    /// The response could not be published.
    PublishFailed,
}

/// Consumes one request-type queue.
pub struct WorkerConsumer {
    broker: Arc<dyn Broker>,
    topology: Topology,
    handler: Arc<dyn RequestHandler>,
}

impl WorkerConsumer {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            broker,
            topology,
            handler,
        }
    }

    pub fn queue_name(&self) -> String {
        queue_name(self.handler.kind())
    }

    /// Declare the durable queue and bind it to the request exchange.
    pub async fn bind(&self) -> bus::Result<()> {
        let queue = self.queue_name();
        let kind = self.handler.kind();
        self.broker
            .declare_queue(&queue, QueueOptions::durable())
            .await?;
        self.broker
            .bind_queue(&queue, kind.as_str(), &self.topology.request_direct)
            .await?;
        info!(queue = %queue, routing_key = %kind, "Worker queue bound");
        Ok(())
    }

    /// Consume until `cancel` fires. A dropped subscription is retried with
    /// exponential backoff; the error is returned once retries run out.
    pub async fn run(&self, cancel: CancellationToken) -> bus::Result<()> {
        let queue = self.queue_name();
        loop {
            let Some(mut messages) = self.subscribe(&queue, &cancel).await? else {
                return Ok(());
            };
            info!(queue = %queue, "Worker consuming");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(queue = %queue, "Worker stopped");
                        return Ok(());
                    }
                    next = messages.next() => next,
                };

                match next {
                    Some(Ok(body)) => {
                        self.process(&body).await;
                    }
                    Some(Err(e)) => {
                        warn!(queue = %queue, error = %e, "Worker delivery failed, resubscribing");
                        break;
                    }
                    None => {
                        warn!(queue = %queue, "Worker stream ended, resubscribing");
                        break;
                    }
                }
            }
        }
    }

    async fn subscribe(
        &self,
        queue: &str,
        cancel: &CancellationToken,
    ) -> bus::Result<Option<MessageStream>> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RESUBSCRIBE_ATTEMPTS)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match self.broker.consume(queue).await {
                Ok(messages) => return Ok(Some(messages)),
                Err(e) => {
                    warn!(queue = %queue, attempt = attempt + 1, error = %e, "Failed to consume worker queue");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BusError::Consume(format!("queue {}: max retries exceeded", queue))))
    }

    /// Handle one routed request body.
    pub async fn process(&self, body: &[u8]) -> Disposition {
        let kind = self.handler.kind();

        let routed = match RoutedRequest::decode(body) {
            Ok(routed) => routed,
            Err(e) => {
                warn!(routing_key = %kind, error = %e, "Dropping malformed routed request");
                return Disposition::Dropped;
            }
        };
        if routed.kind() != Some(kind) {
            warn!(
                routing_key = %kind,
                message_type = %routed.request_type,
                "Dropping routed request of another type"
            );
            return Disposition::Dropped;
        }
        let request = match routed.envelope() {
            Ok(request) => request,
            Err(e) => {
                warn!(identifier = %routed.identifier, error = %e, "Dropping request with malformed payload");
                return Disposition::Dropped;
            }
        };

        let ctx = RequestContext {
            identifier: routed.identifier,
            subject_id: routed.subject_id,
        };
        let response = self.handler.handle(&ctx, request).await;

        // Only successful send_message responses fan out; failures go back to the sender.
        let (exchange, routing_key) = if kind.broadcasts_response() && !response.is_failure() {
            (&self.topology.notify_broadcast, "")
        } else {
            (&self.topology.notify_direct, ctx.identifier.as_str())
        };

        match self
            .broker
            .publish(exchange, routing_key, &response.encode())
            .await
        {
            Ok(()) => {
                debug!(
                    identifier = %ctx.identifier,
                    message_type = %response.type_name(),
                    exchange = %exchange,
                    "Response published"
                );
                Disposition::Responded
            }
            Err(e) => {
                error!(identifier = %ctx.identifier, error = %e, "Failed to publish response");
                Disposition::PublishFailed
            }
        }
    }
}

/// A set of running worker consumers sharing one cancellation token.
pub struct WorkerPool {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Bind every handler's queue, then spawn one consumer task per handler.
    ///
    /// Binding failures are returned before any consumer starts.
    pub async fn start(
        broker: Arc<dyn Broker>,
        topology: Topology,
        handlers: Vec<Arc<dyn RequestHandler>>,
        cancel: CancellationToken,
    ) -> bus::Result<Self> {
        let consumers: Vec<WorkerConsumer> = handlers
            .into_iter()
            .map(|handler| WorkerConsumer::new(Arc::clone(&broker), topology.clone(), handler))
            .collect();

        for consumer in &consumers {
            consumer.bind().await?;
        }

        let tasks = consumers
            .into_iter()
            .map(|consumer| {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let queue = consumer.queue_name();
                    if let Err(e) = consumer.run(cancel).await {
                        error!(queue = %queue, error = %e, "Worker consumer terminated");
                    }
                })
            })
            .collect::<Vec<_>>();

        info!(workers = tasks.len(), "Worker pool started");
        Ok(Self { cancel, tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every consumer and wait for them to stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task failed during shutdown");
            }
        }
        info!("Worker pool stopped");
    }
}
