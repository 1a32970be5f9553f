//! Notification router: session queue to connection.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Outbound;
use crate::bus::MessageStream;
use crate::envelope;
use crate::session::Identifier;

/// How the router loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    Cancelled,
    /// The queue stream ended or failed, or the connection writer went away.
    StreamEnded,
}

/// Forward every decodable message on `messages` to `outbound` verbatim.
///
/// Undecodable messages are logged and skipped. When the stream ends on its
/// own the session token is cancelled so the gateway stops too.
pub async fn run(
    identifier: Identifier,
    mut messages: MessageStream,
    outbound: Outbound,
    cancel: CancellationToken,
) -> RouterExit {
    debug!(identifier = %identifier, "Notification router started");

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RouterExit::Cancelled,
            next = messages.next() => next,
        };

        let body = match next {
            Some(Ok(body)) => body,
            Some(Err(e)) => {
                warn!(identifier = %identifier, error = %e, "Session queue delivery failed");
                break RouterExit::StreamEnded;
            }
            None => break RouterExit::StreamEnded,
        };

        match envelope::decode(&body) {
            Ok(decoded) => {
                debug!(identifier = %identifier, message_type = %decoded.type_name(), "Forwarding notification");
                if !outbound.send_raw(body).await {
                    break RouterExit::StreamEnded;
                }
            }
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Dropping undecodable notification");
            }
        }
    };

    if exit == RouterExit::StreamEnded {
        cancel.cancel();
    }
    info!(identifier = %identifier, exit = ?exit, "Notification router stopped");
    exit
}
