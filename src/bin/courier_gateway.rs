//! courier-gateway: WebSocket and HTTP front-end
//!
//! Accepts client connections and bridges them to the worker pools over AMQP.
//!
//! ## Architecture
//! ```text
//! [Client] <--ws--> [courier-gateway] --request-direct--> [courier-users / courier-messages]
//!                          ^                                        |
//!                          +------ notify-direct / notify-broadcast-+
//! ```
//!
//! ## Configuration
//! - COURIER_CONFIG: YAML configuration file
//! - COURIER__MESSAGING__AMQP__URL: RabbitMQ connection string
//! - COURIER__SERVER__PORT: listen port (default 5000)
//! - COURIER__AUTH__JWT_SECRET: token signing secret

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use courier::bus::init_broker;
use courier::config::Config;
use courier::domain::JwtAuthenticator;
use courier::server::{self, AppState};
use courier::utils::bootstrap::{cancel_on_shutdown, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-gateway");

    let broker = init_broker(&config.messaging).await?;
    config.topology.declare(broker.as_ref()).await?;

    let root = CancellationToken::new();
    cancel_on_shutdown(root.clone());

    let state = AppState::new(
        broker,
        config.topology.clone(),
        Arc::new(JwtAuthenticator::from_config(&config.auth)),
        &config.server,
        root.clone(),
    );

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    server::serve(listener, state, root).await?;

    info!("courier-gateway stopped");
    Ok(())
}
