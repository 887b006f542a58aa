use crate::state::AppState;
use axum::{extract::State, Json};
use relayhub_protocol::IceServer;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct IceServersResponse {
    pub ice_servers: Vec<IceServer>,
}

pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    let mut ice_servers = vec![];

    // Add STUN servers
    for stun_url in &state.config.stun_servers {
        ice_servers.push(IceServer {
            urls: vec![stun_url.clone()],
            username: None,
            credential: None,
        });
    }

    // Add TURN servers
    for turn in state.config.turn_servers() {
        ice_servers.push(IceServer {
            urls: vec![turn.url],
            username: Some(turn.username),
            credential: Some(turn.credential),
        });
    }

    Json(IceServersResponse { ice_servers })
}
