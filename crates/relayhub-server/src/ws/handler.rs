use crate::relay::Dispatch;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use relayhub_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let client_id = Uuid::new_v4();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.connections.add_connection(client_id, tx).await;
    tracing::info!("Client {} connected", client_id);

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let message = match ClientMessage::decode(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", client_id, e);
                        state
                            .connections
                            .send_to_client(
                                client_id,
                                &ServerMessage::Error {
                                    message: "Invalid message format".to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                if state.hub.dispatch(client_id, message).await == Dispatch::Disconnect {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for client {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.hub.on_client_disconnected(client_id).await;
    state.connections.remove_connection(client_id).await;
    send_task.abort();

    tracing::info!("Client {} disconnected", client_id);
}
