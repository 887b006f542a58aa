use crate::media::webrtc::TurnServer;
use crate::relay::{HubSettings, LivenessSettings, RelayHub};
use crate::ws::connections::ConnectionManager;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Server configuration, read from the environment.
///
/// Every field maps to the upper-cased variable of the same name, e.g.
/// `bind_address` to `BIND_ADDRESS`. `STUN_SERVERS` is comma separated.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    pub turn_url: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Set to false to run signaling only, without a WebRTC stack
    pub media_enabled: bool,
    pub settle_delay_ms: u64,
    pub liveness_poll_ms: u64,
    pub liveness_max_attempts: u32,
    pub pending_live_max_attempts: u32,
    pub negotiation_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_url: None,
            turn_username: None,
            turn_credential: None,
            media_enabled: true,
            settle_delay_ms: 500,
            liveness_poll_ms: 2000,
            liveness_max_attempts: 5,
            pending_live_max_attempts: 10,
            negotiation_timeout_ms: 15000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers"),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// The TURN server, when all three TURN variables are set
    pub fn turn_servers(&self) -> Vec<TurnServer> {
        match (&self.turn_url, &self.turn_username, &self.turn_credential) {
            (Some(url), Some(username), Some(credential)) => vec![TurnServer {
                url: url.clone(),
                username: username.clone(),
                credential: credential.clone(),
            }],
            (Some(url), _, _) => {
                tracing::warn!("TURN server {} configured without credentials, ignoring it", url);
                vec![]
            }
            _ => vec![],
        }
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            liveness: LivenessSettings {
                poll_interval: Duration::from_millis(self.liveness_poll_ms),
                max_search_attempts: self.liveness_max_attempts,
                max_pending_attempts: self.pending_live_max_attempts,
            },
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub connections: Arc<ConnectionManager>,
    pub hub: Arc<RelayHub>,
}

impl AppState {
    pub fn new(config: Config, hub: Arc<RelayHub>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            config,
            connections,
            hub,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        let settings = config.hub_settings();

        assert_eq!(settings.settle_delay, Duration::from_millis(500));
        assert_eq!(settings.negotiation_timeout, Duration::from_secs(15));
        assert_eq!(settings.liveness, LivenessSettings::default());
        assert!(config.media_enabled);
    }

    #[test]
    fn turn_server_needs_credentials() {
        let mut config = Config {
            turn_url: Some("turn:turn.example.com:3478".to_string()),
            ..Config::default()
        };
        assert!(config.turn_servers().is_empty());

        config.turn_username = Some("relay".to_string());
        config.turn_credential = Some("secret".to_string());
        let servers = config.turn_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].url, "turn:turn.example.com:3478");
    }
}
