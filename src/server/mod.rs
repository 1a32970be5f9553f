//! Connection front-end.
//!
//! Routes:
//! - `GET /ws/auth`: authenticated WebSocket; the first frame carries the token
//! - `GET /ws/{identifier}`: WebSocket over a queue minted by the HTTP endpoints
//! - `POST /api/register`, `POST /api/login`: submit the request, answer 202
//! - `GET /health`

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bridge::{Bridge, BridgeOptions};
use crate::bus::{Broker, Topology};
use crate::config::ServerConfig;
use crate::domain::{Authenticator, DomainError};
use crate::envelope::DecodeError;
use crate::session::{SessionError, SessionManager};

pub mod api;
pub mod ws;

/// Per-connection settings taken from [`ServerConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub outbound_buffer: usize,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            // Zero would make the ping ticker panic.
            ping_interval: config.ping_interval().max(Duration::from_secs(1)),
            outbound_buffer: config.outbound_buffer,
        }
    }
}

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub bridge: Bridge,
    pub authenticator: Arc<dyn Authenticator>,
    pub settings: ConnectionSettings,
}

impl AppState {
    pub fn new(
        broker: Arc<dyn Broker>,
        topology: Topology,
        authenticator: Arc<dyn Authenticator>,
        config: &ServerConfig,
        root: CancellationToken,
    ) -> Self {
        let bridge = Bridge::new(
            Arc::clone(&broker),
            topology.clone(),
            BridgeOptions {
                read_timeout: config.read_timeout(),
            },
        );
        Self {
            sessions: SessionManager::new(broker, topology, root),
            bridge,
            authenticator,
            settings: ConnectionSettings::from(config),
        }
    }
}

/// Build the axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/auth", get(ws::authenticated))
        .route("/ws/{identifier}", get(ws::anonymous))
        .route("/api/register", post(api::register))
        .route("/api/login", post(api::login))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(address = ?listener.local_addr().ok(), "Courier gateway listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

/// HTTP-facing errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        match self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SessionError> for ServerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::InvalidIdentifier(_) => ServerError::BadRequest(e.to_string()),
            SessionError::QueueNotFound(_) => ServerError::NotFound(e.to_string()),
            SessionError::Bus(bus) => ServerError::Unavailable(bus.to_string()),
        }
    }
}

impl From<DomainError> for ServerError {
    fn from(e: DomainError) -> Self {
        match e {
            DomainError::NotFound(_) => ServerError::NotFound(e.to_string()),
            DomainError::Conflict(_) | DomainError::Invalid(_) | DomainError::Unauthorized(_) => {
                ServerError::BadRequest(e.to_string())
            }
        }
    }
}

impl From<DecodeError> for ServerError {
    fn from(e: DecodeError) -> Self {
        ServerError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use crate::session::Identifier;

    #[test]
    fn test_error_status_mapping() {
        let not_found: ServerError = SessionError::QueueNotFound(Identifier::new()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let bad: ServerError = SessionError::InvalidIdentifier("x".to_string()).into();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let down: ServerError = SessionError::Bus(BusError::Publish("x".to_string())).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);

        let invalid: ServerError = DomainError::Invalid("x".to_string()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_zero_ping_interval_clamped() {
        let config = ServerConfig {
            ping_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            ConnectionSettings::from(&config).ping_interval,
            Duration::from_secs(1)
        );
    }
}
