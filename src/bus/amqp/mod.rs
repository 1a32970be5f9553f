//! AMQP (RabbitMQ) broker implementation.
//!
//! One connection per process. Mutating operations share a single channel
//! guarded by an async mutex; each consumer gets its own channel so that a
//! channel-level error on one session cannot cancel another session's
//! deliveries.

use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind as AmqpExchangeKind,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    AmqpBrokerConfig, Broker, BusError, ExchangeKind, MessageStream, QueueOptions, Result,
};

/// AMQP broker over a single RabbitMQ connection.
pub struct AmqpBroker {
    connection: Connection,
    /// Shared channel for declarations, bindings and publishes.
    channel: Mutex<Channel>,
}

impl AmqpBroker {
    /// Connect to RabbitMQ, retrying with exponential backoff and jitter.
    pub async fn connect(config: &AmqpBrokerConfig) -> Result<Self> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(config.connect_retries)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match Connection::connect(&config.url, ConnectionProperties::default()).await {
                Ok(connection) => {
                    let channel = connection.create_channel().await.map_err(|e| {
                        BusError::Connection(format!("Failed to create channel: {}", e))
                    })?;

                    info!(url = %config.url, attempt = attempt + 1, "Connected to AMQP");

                    return Ok(Self {
                        connection,
                        channel: Mutex::new(channel),
                    });
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = config.connect_retries,
                        error = %e,
                        "Failed to connect to AMQP, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(BusError::Connection(format!(
            "Failed to connect to {}: {}",
            config.url,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "max retries exceeded".to_string())
        )))
    }

    /// Lock the shared channel, reopening it if the broker closed it.
    ///
    /// AMQP closes a channel on any channel-level exception (for example a
    /// 404 on a queue that was already auto-deleted), so the shared channel
    /// is replaced rather than left dead for every other caller.
    async fn channel(&self) -> Result<tokio::sync::MutexGuard<'_, Channel>> {
        let mut guard = self.channel.lock().await;
        if !guard.status().connected() {
            warn!("Shared AMQP channel closed, reopening");
            *guard = self
                .connection
                .create_channel()
                .await
                .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;
        }
        Ok(guard)
    }

    fn exchange_kind(kind: ExchangeKind) -> AmqpExchangeKind {
        match kind {
            ExchangeKind::Direct => AmqpExchangeKind::Direct,
            ExchangeKind::Fanout => AmqpExchangeKind::Fanout,
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                name,
                Self::exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("exchange {}: {}", name, e)))?;

        debug!(exchange = %name, kind = ?kind, "Declared exchange");
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Declare(format!("queue {}: {}", name, e)))?;

        debug!(queue = %name, durable = options.durable, "Declared queue");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Bind(format!("{} -> {}: {}", queue, exchange, e)))?;

        debug!(queue = %queue, exchange = %exchange, routing_key = %routing_key, "Bound queue");
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(|e| BusError::Bind(format!("unbind {} -> {}: {}", queue, exchange, e)))
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|e| BusError::Delete(format!("queue {}: {}", name, e)))?;

        debug!(queue = %name, "Deleted queue");
        Ok(())
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        // A passive declare of a missing queue closes the channel it runs
        // on, so probe on a throwaway channel.
        let _guard = self.channel.lock().await;
        let probe = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let exists = probe
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .is_ok();

        if probe.status().connected() {
            let _ = probe.close(200, "probe done").await;
        }
        Ok(exists)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<MessageStream> {
        let _guard = self.channel.lock().await;
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("courier-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("queue {}: {}", queue, e)))?;

        info!(queue = %queue, "Consumer started");

        let queue = queue.to_string();
        // The channel moves into the stream so it lives exactly as long as
        // the consumer does.
        let stream = consumer.map(move |delivery| {
            let _channel = &channel;
            delivery.map(|d| d.data).map_err(|e| {
                error!(queue = %queue, error = %e, "Consumer delivery error");
                BusError::Consume(e.to_string())
            })
        });

        Ok(stream.boxed())
    }
}
