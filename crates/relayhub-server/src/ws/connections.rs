use relayhub_protocol::ServerMessage;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound half of every connected client.
///
/// Messages are serialized once and queued on the client's channel; the
/// socket task drains it. Hub code only ever sees client ids.
pub struct ConnectionManager {
    senders: RwLock<HashMap<Uuid, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, client_id: Uuid, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(client_id, sender);
        tracing::debug!("Client {} connected", client_id);
    }

    pub async fn remove_connection(&self, client_id: Uuid) {
        if self.senders.write().await.remove(&client_id).is_some() {
            tracing::debug!("Client {} disconnected", client_id);
        }
    }

    pub async fn send_to_client(&self, client_id: Uuid, message: &ServerMessage) {
        let json = match message.encode() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(&client_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::error!("Failed to send message to {}: {}", client_id, e);
                }
            }
            None => tracing::debug!("Client {} is gone, dropping message", client_id),
        }
    }

    pub async fn send_to_clients(&self, client_ids: &[Uuid], message: &ServerMessage) {
        let json = match message.encode() {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        for client_id in client_ids {
            if let Some(sender) = senders.get(client_id) {
                if let Err(e) = sender.send(json.clone()) {
                    tracing::error!("Failed to send message to {}: {}", client_id, e);
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
