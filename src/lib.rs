//! Courier - asynchronous correlation bridge
//!
//! Connects persistent WebSocket sessions to broker-driven worker pools over
//! fire-and-forget publish/subscribe. Every session gets a private ephemeral
//! queue; requests are routed to worker queues by type, and responses find
//! their way back through the session's identifier.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod server;
pub mod session;
pub mod utils;
pub mod worker;
