//! WebSocket endpoint for claimants.
//!
//! `GET /ws/{token}` upgrades to a persistent connection. The token is the
//! claimant's identity; an unknown token gets an `InvalidClaimant` frame and
//! an immediate close. A known token is registered (replacing any previous
//! connection for the same claimant), acknowledged with `Connected`, and — if
//! the session is already open — sent a personalized start snapshot.
//!
//! The connection task is a thin shim: inbound claim frames are enqueued on
//! the admission pipeline and the reply arrives later through the outbound
//! channel, so a slow claim never blocks the socket reader.

use super::AppState;
use allocation_protocol::{ClientMessage, ServerMessage};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

/// Handle the WebSocket upgrade for `GET /ws/{token}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, token, state))
}

async fn handle_socket(socket: WebSocket, token: String, state: AppState) {
    let Some(display_name) = state.claimants.get(&token).cloned() else {
        reject_unknown(socket).await;
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        tokio::sync::mpsc::channel(crate::session::registry::OUTBOUND_CHANNEL_BUFFER);
    let cancel = state.session.child_token();

    let connection_id = state
        .registry
        .connect(&token, &display_name, outbound_tx, cancel.clone())
        .await;
    info!(
        target: "alloc.ws",
        claimant = %display_name,
        connection_id = %connection_id,
        "Claimant connected"
    );

    // If the session is already open the pipeline answers with a snapshot;
    // otherwise the request is dropped and the open fan-out covers us.
    if let Err(e) = state.session.start_snapshot(token.clone()) {
        warn!(target: "alloc.ws", error = %e, "Pipeline unavailable at connect");
    }

    loop {
        tokio::select! {
            // A replacing connection (or process shutdown) cancels us.
            () = cancel.cancelled() => {
                debug!(
                    target: "alloc.ws",
                    claimant = %display_name,
                    connection_id = %connection_id,
                    "Connection cancelled"
                );
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }

            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                match serde_json::to_string(&message) {
                    Ok(text) => {
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "alloc.ws", error = %e, "Failed to serialize frame");
                    }
                }
            }

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &token, &text, &mut ws_tx).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        send_protocol_error(&mut ws_tx, "expected a JSON text frame").await;
                    }
                    // Axum answers pings itself.
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
        }
    }

    state.registry.disconnect(&token, connection_id).await;
    info!(
        target: "alloc.ws",
        claimant = %display_name,
        connection_id = %connection_id,
        "Claimant disconnected"
    );
}

/// Parse one inbound text frame and enqueue the command it carries. A frame
/// that does not parse poisons only itself: the client gets a
/// `ProtocolError` frame and the connection stays up.
async fn handle_frame(
    state: &AppState,
    token: &str,
    text: &str,
    ws_tx: &mut (impl SinkExt<Message> + Unpin),
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Claim { resource_id }) => {
            if let Err(e) = state.session.claim(token.to_string(), resource_id) {
                warn!(target: "alloc.ws", error = %e, "Failed to enqueue claim");
                send_protocol_error(ws_tx, &e.client_message()).await;
            }
        }
        Err(e) => {
            debug!(target: "alloc.ws", error = %e, "Unparseable client frame");
            metrics::counter!("alloc_protocol_errors_total").increment(1);
            send_protocol_error(ws_tx, "unrecognized message").await;
        }
    }
}

async fn send_protocol_error(ws_tx: &mut (impl SinkExt<Message> + Unpin), message: &str) {
    let frame = ServerMessage::ProtocolError {
        message: message.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = ws_tx.send(Message::Text(text)).await;
    }
}

/// Unknown token: one `InvalidClaimant` frame, then close. The token itself
/// is never logged.
async fn reject_unknown(mut socket: WebSocket) {
    warn!(target: "alloc.ws", "Connection attempt with unknown claimant token");
    metrics::counter!("alloc_invalid_claimants_total").increment(1);
    if let Ok(text) = serde_json::to_string(&ServerMessage::InvalidClaimant) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}
