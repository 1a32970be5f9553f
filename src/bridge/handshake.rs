//! Authentication exchange for the authenticated route.
//!
//! The first data frame must be `{"type":"auth","token":"<bearer>"}`. The
//! handshake runs before any queue is declared, so a failed handshake never
//! touches the broker.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::{Frame, InboundError};
use crate::domain::{AuthError, Authenticator, Identity};
use crate::envelope::{self, DecodeError, Envelope};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Authentication timed out")]
    Timeout,

    #[error("Connection closed before authentication")]
    Closed,

    #[error("Connection read failed: {0}")]
    Read(#[from] InboundError),

    #[error("Invalid message: {0}")]
    Invalid(#[from] DecodeError),

    #[error("Expected auth message, got {0}")]
    UnexpectedType(String),

    #[error("Missing token")]
    MissingToken,

    #[error("Authentication failed: {0}")]
    Rejected(#[from] AuthError),
}

/// Wait up to `timeout` for the auth frame and validate its token.
///
/// Keep-alive frames are skipped; the deadline covers the whole exchange.
pub async fn authenticate<S>(
    inbound: &mut S,
    authenticator: &dyn Authenticator,
    timeout: Duration,
) -> Result<Identity, HandshakeError>
where
    S: Stream<Item = Result<Frame, InboundError>> + Send + Unpin,
{
    let frame = tokio::time::timeout(timeout, async {
        loop {
            match inbound.next().await {
                Some(Ok(Frame::Data(bytes))) => return Ok(bytes),
                Some(Ok(Frame::KeepAlive)) => continue,
                Some(Err(e)) => return Err(HandshakeError::Read(e)),
                None => return Err(HandshakeError::Closed),
            }
        }
    })
    .await
    .map_err(|_| HandshakeError::Timeout)??;

    let token = match envelope::decode(&frame)? {
        Envelope::Auth(auth) => auth.token.ok_or(HandshakeError::MissingToken)?,
        other => return Err(HandshakeError::UnexpectedType(other.type_name().to_string())),
    };

    match authenticator.validate(&token).await {
        Ok(identity) => {
            debug!(user_id = identity.user_id, "Handshake succeeded");
            Ok(identity)
        }
        Err(e) => {
            warn!(error = %e, "Handshake rejected");
            Err(e.into())
        }
    }
}
