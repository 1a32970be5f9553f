//! Connection front-end configuration types.

use std::time::Duration;

use serde::Deserialize;

/// HTTP/WebSocket server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Seconds a session may stay silent before it is closed.
    pub read_timeout_secs: u64,
    /// Seconds allowed for the auth frame on the authenticated route.
    pub handshake_timeout_secs: u64,
    /// Seconds between pings to idle peers.
    pub ping_interval_secs: u64,
    /// Outbound frames buffered per connection before the router waits.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            read_timeout_secs: 120,
            handshake_timeout_secs: 10,
            ping_interval_secs: 30,
            outbound_buffer: 256,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
