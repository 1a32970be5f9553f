//! courier-messages: messages worker pool
//!
//! Serves `get_messages` and `send_message`. Successful `send_message`
//! responses are published to the broadcast exchange so every open session
//! sees new messages.
//!
//! ## Configuration
//! - COURIER_CONFIG: YAML configuration file
//! - COURIER__MESSAGING__AMQP__URL: RabbitMQ connection string

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::bus::init_broker;
use courier::config::Config;
use courier::domain::InMemoryMessageStore;
use courier::utils::bootstrap::{init_tracing, shutdown_signal};
use courier::worker::{message_handlers, WorkerPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-messages");

    let broker = init_broker(&config.messaging).await?;
    config.topology.declare(broker.as_ref()).await?;

    let pool = WorkerPool::start(
        broker,
        config.topology.clone(),
        message_handlers(Arc::new(InMemoryMessageStore::new())),
        CancellationToken::new(),
    )
    .await?;

    info!("Messages worker running, press Ctrl+C to exit");
    shutdown_signal().await;
    pool.shutdown().await;
    Ok(())
}
