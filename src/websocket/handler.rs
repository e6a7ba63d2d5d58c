use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::channel::ChannelCommand;
use crate::connection_manager::{ConnectionError, ConnectionHandle, ConnectionOrigin};
use crate::metrics::{ConnectionMetrics, FrameMetrics};
use crate::server::AppState;

use super::message::{ClientFrame, OutboundMessage, ServerMessage};

/// WebSocket upgrade handler.
///
/// The client's `Sec-WebSocket-Key` doubles as its connection identity.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let identity_hint = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let origin = ConnectionOrigin::from_request(&headers, Some(peer));

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity_hint, origin))
}

/// Drive one established WebSocket until either side goes away
async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    identity_hint: Option<String>,
    origin: ConnectionOrigin,
) {
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(state.settings.websocket.send_buffer.max(1));

    let handle = match state.connection_manager.register(identity_hint, origin, tx) {
        Ok(h) => h,
        Err(e) => {
            reject(socket, &e).await;
            return;
        }
    };
    let connection_start = std::time::Instant::now();
    ConnectionMetrics::record_opened(state.connection_manager.connection_count());

    tracing::info!(
        connection_id = %handle.identity,
        user_id = handle.user_id,
        ip = ?handle.origin.ip,
        user_agent = ?handle.origin.user_agent,
        connections = state.connection_manager.connection_count(),
        "WebSocket connection established"
    );

    let _ = handle.send(ServerMessage::handshake(handle.identity.clone())).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer: the only task that touches the sink
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match msg {
                OutboundMessage::Ping => Message::Ping(Bytes::new()),
                OutboundMessage::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Utf8Bytes::from_static(reason),
                        })))
                        .await;
                    break;
                }
                other => match other.to_json() {
                    Ok(Some(text)) => Message::Text(text.into()),
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize message");
                        continue;
                    }
                },
            };

            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let state_clone = state.clone();
    let handle_clone = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &state_clone, &handle_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %handle.identity, "Send task completed");
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %handle.identity, "Receive task completed");
        }
        _ = handle.terminated() => {
            tracing::debug!(connection_id = %handle.identity, "Connection terminated");
        }
    }
    send_task.abort();
    recv_task.abort();

    state.channels.unsubscribe_all(&handle).await;
    state.connection_manager.unregister(&handle);

    let remaining = state.connection_manager.connection_count();
    ConnectionMetrics::record_closed(remaining);
    tracing::info!(
        connection_id = %handle.identity,
        user_id = handle.user_id,
        duration_secs = connection_start.elapsed().as_secs_f64(),
        connections = remaining,
        "WebSocket connection closed"
    );
}

/// Close a connection that could not be registered
async fn reject(socket: WebSocket, error: &ConnectionError) {
    let reason = match error {
        ConnectionError::LimitExceeded { .. } => "limit",
        ConnectionError::InvalidUser { .. } => "invalid_user",
    };
    ConnectionMetrics::record_rejected(reason);
    tracing::warn!(error = %error, close_code = error.close_code(), "Connection rejected");

    let (mut ws_sender, _) = socket.split();
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code: error.close_code(),
            reason: Utf8Bytes::from(error.to_string()),
        })))
        .await;
    let _ = ws_sender.close().await;
}

/// Process a received WebSocket message.
/// Returns false if the connection should be closed
async fn process_message(msg: Message, state: &AppState, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.mark_alive();
            FrameMetrics::record_text();

            let frame = match ClientFrame::parse(text.as_str()) {
                Ok(frame) => frame,
                Err(e) => {
                    FrameMetrics::record_rejected();
                    tracing::debug!(connection_id = %handle.identity, error = %e, "Malformed frame");
                    let _ = handle.send(ServerMessage::error(e.to_string())).await;
                    return true;
                }
            };

            handle_frame(frame, state, handle).await;
            true
        }
        Message::Binary(_) => {
            handle.mark_alive();
            FrameMetrics::record_binary();
            let _ = handle
                .send(ServerMessage::error("Binary messages are not supported"))
                .await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.mark_alive();
            FrameMetrics::record_control();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.identity, "Received close frame");
            false
        }
    }
}

/// Route one parsed frame.
///
/// Action commands must carry the connection's own identity; anything else is
/// dropped without a reply. Errors and panics inside a channel are reported to
/// the sender and never take the connection down.
#[tracing::instrument(
    name = "ws.command",
    skip(frame, state, handle),
    fields(connection_id = %handle.identity, channel = %frame.channel)
)]
async fn handle_frame(frame: ClientFrame, state: &AppState, handle: &Arc<ConnectionHandle>) {
    if let ChannelCommand::Action(action) = &frame.command {
        if action.uuid != handle.identity {
            FrameMetrics::record_dropped();
            tracing::debug!(action = %action.action, "Dropping command with foreign uuid");
            return;
        }
    }

    let outcome = AssertUnwindSafe(state.channels.dispatch(&frame.channel, frame.command, handle))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Command dispatch failed");
            let _ = handle.send(ServerMessage::error(e.to_string())).await;
        }
        Err(_) => {
            tracing::error!("Command dispatch panicked");
            let _ = handle.send(ServerMessage::error("Internal error")).await;
        }
    }
}
