//! courier-users: users worker pool
//!
//! Serves `registration`, `login`, `get_users` and `get_self` requests from
//! the request exchange and publishes the responses back to the requesting
//! sessions.
//!
//! ## Configuration
//! - COURIER_CONFIG: YAML configuration file
//! - COURIER__MESSAGING__AMQP__URL: RabbitMQ connection string
//! - COURIER__AUTH__JWT_SECRET: token signing secret (must match the gateway)

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::bus::init_broker;
use courier::config::Config;
use courier::domain::{InMemoryUserStore, JwtAuthenticator, Sha256PasswordHasher};
use courier::utils::bootstrap::{init_tracing, shutdown_signal};
use courier::worker::{user_handlers, WorkerPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-users");

    let broker = init_broker(&config.messaging).await?;
    config.topology.declare(broker.as_ref()).await?;

    let handlers = user_handlers(
        Arc::new(InMemoryUserStore::new()),
        Arc::new(Sha256PasswordHasher),
        Arc::new(JwtAuthenticator::from_config(&config.auth)),
    );
    let pool = WorkerPool::start(
        broker,
        config.topology.clone(),
        handlers,
        CancellationToken::new(),
    )
    .await?;

    info!("Users worker running, press Ctrl+C to exit");
    shutdown_signal().await;
    pool.shutdown().await;
    Ok(())
}
