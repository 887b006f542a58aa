//! Relay Hub Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod media;
pub mod relay;
pub mod state;
pub mod ws;

use media::webrtc::WebrtcRuntime;
use media::MediaRuntime;
use relay::RelayHub;
use std::sync::Arc;
use ws::connections::ConnectionManager;

/// Build the media runtime the config asks for. A runtime that fails to start
/// leaves the hub running without media; producer offers are then refused.
pub fn create_media_runtime(config: &state::Config) -> Option<Arc<dyn MediaRuntime>> {
    if !config.media_enabled {
        tracing::warn!("Media disabled, running signaling only");
        return None;
    }

    match WebrtcRuntime::new(&config.stun_servers, &config.turn_servers()) {
        Ok(runtime) => Some(Arc::new(runtime)),
        Err(e) => {
            tracing::error!("Failed to start WebRTC runtime, running without media: {}", e);
            None
        }
    }
}

/// Create and configure the server application
pub fn create_app(
    config: state::Config,
    runtime: Option<Arc<dyn MediaRuntime>>,
) -> (axum::Router, Arc<RelayHub>) {
    let connections = Arc::new(ConnectionManager::new());
    let hub = RelayHub::new(runtime, connections.clone(), config.hub_settings());
    let app_state = state::AppState::new(config, hub.clone(), connections);
    (api::create_router(app_state), hub)
}
