//! Broker adapter.
//!
//! This module contains:
//! - `Broker` trait: the serialized publish/subscribe primitives every other
//!   component talks to
//! - `Topology`: the three exchanges the bridge routes through
//! - Broker configuration types and the `init_broker` factory
//! - Implementations: AMQP (RabbitMQ), in-process channels

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use tracing::info;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Declare failed: {0}")]
    Declare(String),

    #[error("Bind failed: {0}")]
    Bind(String),

    #[error("Delete failed: {0}")]
    Delete(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Queue '{0}' not found")]
    QueueNotFound(String),

    #[error("Exchange '{0}' not found")]
    ExchangeNotFound(String),
}

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Delivers only to queues bound with a matching routing key.
    Direct,
    /// Delivers to every bound queue regardless of routing key.
    Fanout,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a broker restart.
    pub durable: bool,
    /// Removed by the broker once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Per-connection queue: transient, removed when its consumer disconnects.
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            auto_delete: true,
        }
    }

    /// Long-lived worker queue.
    pub fn durable() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Lazy sequence of message bodies delivered to one queue.
///
/// The stream ends when the queue is deleted or the consumer is cancelled
/// by the broker.
pub type MessageStream = BoxStream<'static, Result<Vec<u8>>>;

/// Publish/subscribe primitives over a single shared broker connection.
///
/// Implementations serialize every mutating call internally; callers may
/// share one instance across all sessions and workers.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP
/// - `ChannelBroker`: in-process exchanges and queues for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare an exchange. Idempotent for an identical declaration.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Declare a queue. Idempotent for an identical declaration.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Remove a binding created by `bind_queue`.
    async fn unbind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()>;

    /// Delete a queue along with its bindings, ending any consumer stream.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Check whether a queue currently exists.
    async fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Publish a message body. Fire-and-forget: no consumer is required.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Start consuming a queue.
    ///
    /// Deliveries are acknowledged on receipt (at-most-once).
    async fn consume(&self, queue: &str) -> Result<MessageStream>;
}

// ============================================================================
// Topology
// ============================================================================

/// Exchange names the bridge routes through.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Topology {
    /// Direct exchange carrying per-connection responses (key = identifier).
    pub notify_direct: String,
    /// Fanout exchange carrying messages for every open session.
    pub notify_broadcast: String,
    /// Direct exchange carrying requests (key = request type name).
    pub request_direct: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            notify_direct: "notify-direct".to_string(),
            notify_broadcast: "notify-broadcast".to_string(),
            request_direct: "request-direct".to_string(),
        }
    }
}

impl Topology {
    /// Declare all three exchanges.
    ///
    /// Called once at process start; a failure here leaves the process
    /// unable to serve any traffic and should abort it.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<()> {
        broker
            .declare_exchange(&self.notify_direct, ExchangeKind::Direct)
            .await?;
        broker
            .declare_exchange(&self.notify_broadcast, ExchangeKind::Fanout)
            .await?;
        broker
            .declare_exchange(&self.request_direct, ExchangeKind::Direct)
            .await?;

        info!(
            notify_direct = %self.notify_direct,
            notify_broadcast = %self.notify_broadcast,
            request_direct = %self.request_direct,
            "Broker topology declared"
        );
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-process channels (single process only).
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBrokerConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBrokerConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Maximum connection attempts at startup.
    pub connect_retries: usize,
}

impl Default for AmqpBrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_retries: 10,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp` (included in default)
pub async fn init_broker(config: &MessagingConfig) -> Result<Arc<dyn Broker>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let broker = AmqpBroker::connect(&config.amqp).await?;
                info!(messaging_type = "amqp", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Broker initialized");
            Ok(Arc::new(ChannelBroker::new()))
        }
    }
}
