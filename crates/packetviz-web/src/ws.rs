//! WebSocket fan-out of packet events

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let clients = state.clients.fetch_add(1, Ordering::Relaxed) + 1;
    info!("Client connected ({} connected)", clients);

    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => match serde_json::to_string(event.as_ref()) {
                        Ok(json) => {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to serialize event: {}", e),
                    },
                    // slow client, skip what it missed
                    Err(RecvError::Lagged(n)) => {
                        debug!("Client lagged, skipped {} events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let clients = state.clients.fetch_sub(1, Ordering::Relaxed) - 1;
    info!("Client disconnected ({} connected)", clients);
}
