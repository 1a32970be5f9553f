//! HTTP endpoints for the unauthenticated flow.
//!
//! Each call mints an identifier, provisions its queue, publishes the
//! request and answers 202 with the identifier. The client then attaches to
//! `/ws/{identifier}` to receive the worker's response.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AppState, ServerError};
use crate::domain::validate_credentials;
use crate::envelope::{Credentials, Envelope, RoutedRequest};
use crate::session::{Authentication, Identifier};

/// Body of a 202 answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    pub uuid: String,
    pub message: String,
}

/// `POST /api/register`
pub async fn register(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<Accepted>), ServerError> {
    validate_credentials(&credentials.username, &credentials.password)?;
    submit(
        &state,
        Envelope::RegistrationRequest(credentials),
        "Registration request submitted",
    )
    .await
}

/// `POST /api/login`
pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<Accepted>), ServerError> {
    validate_credentials(&credentials.username, &credentials.password)?;
    submit(
        &state,
        Envelope::LoginRequest(credentials),
        "Login request submitted",
    )
    .await
}

async fn submit(
    state: &AppState,
    request: Envelope,
    message: &str,
) -> Result<(StatusCode, Json<Accepted>), ServerError> {
    let identifier = Identifier::new();
    let routed = RoutedRequest::new(identifier.as_str(), None, &request)?;

    state
        .sessions
        .provision(&identifier, Authentication::Anonymous)
        .await?;

    let broker = state.sessions.broker();
    let topology = state.sessions.topology();
    if let Err(e) = broker
        .publish(&topology.request_direct, &routed.request_type, &routed.encode())
        .await
    {
        warn!(identifier = %identifier, error = %e, "Failed to publish HTTP request");
        if let Err(cleanup) = broker.delete_queue(identifier.as_str()).await {
            warn!(identifier = %identifier, error = %cleanup, "Failed to remove pending queue");
        }
        return Err(ServerError::Unavailable(e.to_string()));
    }

    info!(identifier = %identifier, request_type = %routed.request_type, "HTTP request submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            uuid: identifier.to_string(),
            message: message.to_string(),
        }),
    ))
}
