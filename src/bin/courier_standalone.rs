//! courier-standalone: everything in one process
//!
//! Runs the gateway and both worker pools over the in-process channel
//! broker. No RabbitMQ required; intended for local development.
//!
//! ## Architecture
//! ```text
//! courier-standalone (single process)
//!     ├── Gateway (HTTP + WebSocket on :5000)
//!     ├── Users worker pool
//!     ├── Messages worker pool
//!     └── ChannelBroker (tokio channels)
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::bus::{Broker, ChannelBroker};
use courier::config::Config;
use courier::domain::{
    InMemoryMessageStore, InMemoryUserStore, JwtAuthenticator, Sha256PasswordHasher,
};
use courier::server::{self, AppState};
use courier::utils::bootstrap::{cancel_on_shutdown, init_tracing};
use courier::worker::{message_handlers, user_handlers, WorkerPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-standalone");

    let broker: Arc<dyn Broker> = Arc::new(ChannelBroker::new());
    config.topology.declare(broker.as_ref()).await?;

    let root = CancellationToken::new();
    cancel_on_shutdown(root.clone());

    let authenticator = Arc::new(JwtAuthenticator::from_config(&config.auth));

    let mut handlers = user_handlers(
        Arc::new(InMemoryUserStore::new()),
        Arc::new(Sha256PasswordHasher),
        authenticator.clone(),
    );
    handlers.extend(message_handlers(Arc::new(InMemoryMessageStore::new())));
    let pool = WorkerPool::start(
        Arc::clone(&broker),
        config.topology.clone(),
        handlers,
        root.child_token(),
    )
    .await?;

    let state = AppState::new(
        broker,
        config.topology.clone(),
        authenticator,
        &config.server,
        root.clone(),
    );
    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    server::serve(listener, state, root).await?;

    pool.shutdown().await;
    info!("courier-standalone stopped");
    Ok(())
}
