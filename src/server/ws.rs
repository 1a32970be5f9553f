//! WebSocket routes.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::{BoxStream, SplitSink};
use futures::{future, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AppState, ConnectionSettings, ServerError};
use crate::bridge::{authenticate, Frame, InboundError, Outbound};
use crate::envelope::Envelope;
use crate::session::{Authentication, Identifier};

type Inbound = BoxStream<'static, Result<Frame, InboundError>>;

/// `GET /ws/auth`
pub async fn authenticated(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_authenticated(socket, state))
}

/// `GET /ws/{identifier}`
pub async fn anonymous(
    ws: WebSocketUpgrade,
    Path(identifier): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ServerError> {
    let identifier = Identifier::parse(&identifier)?;
    if !state.sessions.queue_exists(&identifier).await? {
        return Err(ServerError::NotFound(format!(
            "No pending session for {}",
            identifier
        )));
    }
    Ok(ws.on_upgrade(move |socket| handle_anonymous(socket, state, identifier)))
}

async fn handle_authenticated(socket: WebSocket, state: AppState) {
    let (mut inbound, outbound, writer) = split(socket, &state.settings);

    let identity = match authenticate(
        &mut inbound,
        state.authenticator.as_ref(),
        state.settings.handshake_timeout,
    )
    .await
    {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "WebSocket authentication failed");
            outbound.send_envelope(&Envelope::error(e.to_string())).await;
            finish(outbound, writer).await;
            return;
        }
    };

    let session = match state
        .sessions
        .open(Authentication::Authenticated {
            subject_id: identity.user_id,
        })
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(user_id = identity.user_id, error = %e, "Failed to open session");
            outbound
                .send_envelope(&Envelope::error("Failed to open session"))
                .await;
            finish(outbound, writer).await;
            return;
        }
    };

    info!(
        identifier = %session.identifier(),
        user_id = identity.user_id,
        "Authenticated WebSocket connection established"
    );
    outbound.send_envelope(&Envelope::auth_success()).await;

    let reason = state.bridge.run(session, inbound, outbound).await;
    debug!(reason = ?reason, "Authenticated WebSocket finished");
    await_writer(writer).await;
}

async fn handle_anonymous(socket: WebSocket, state: AppState, identifier: Identifier) {
    let (inbound, outbound, writer) = split(socket, &state.settings);

    let session = match state.sessions.attach(identifier.clone()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(identifier = %identifier, error = %e, "Failed to attach session");
            outbound.send_envelope(&Envelope::error(e.to_string())).await;
            finish(outbound, writer).await;
            return;
        }
    };

    info!(identifier = %identifier, "Unauthenticated WebSocket connection established");
    let reason = state.bridge.run(session, inbound, outbound).await;
    debug!(identifier = %identifier, reason = ?reason, "Unauthenticated WebSocket finished");
    await_writer(writer).await;
}

/// Split a socket into the bridge's inbound stream, an outbound channel and
/// the writer task draining it.
fn split(socket: WebSocket, settings: &ConnectionSettings) -> (Inbound, Outbound, JoinHandle<()>) {
    let (sender, receiver) = socket.split();
    let (outbound, rx) = Outbound::channel(settings.outbound_buffer);
    let writer = tokio::spawn(write_loop(sender, rx, settings.ping_interval));

    let inbound = receiver
        .take_while(|item| future::ready(!matches!(item, Ok(Message::Close(_)))))
        .filter_map(|item| {
            future::ready(match item {
                Ok(Message::Text(text)) => Some(Ok(Frame::Data(text.as_str().as_bytes().to_vec()))),
                Ok(Message::Binary(bytes)) => Some(Ok(Frame::Data(bytes.to_vec()))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Some(Ok(Frame::KeepAlive)),
                Ok(Message::Close(_)) => None,
                Err(e) => Some(Err(InboundError::Read(e.to_string()))),
            })
        })
        .boxed();

    (inbound, outbound, writer)
}

/// Drain `rx` into the socket, pinging on `ping_interval`, then close it.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(bytes) = frame else { break };
                let text = match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping non UTF-8 outbound frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    let _ = sender.close().await;
}

async fn finish(outbound: Outbound, writer: JoinHandle<()>) {
    drop(outbound);
    await_writer(writer).await;
}

async fn await_writer(writer: JoinHandle<()>) {
    if let Err(e) = writer.await {
        warn!(error = %e, "WebSocket writer task failed");
    }
}
