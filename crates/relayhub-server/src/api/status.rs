use crate::state::AppState;
use axum::{extract::State, Json};
use relayhub_protocol::RelayStatusData;

pub async fn get_status(State(state): State<AppState>) -> Json<RelayStatusData> {
    Json(state.hub.status().await)
}
