use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role a client declares when accepting the connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Producer,
    #[default]
    Consumer,
}

/// ICE candidate descriptor. The camelCase names `RTCIceCandidate.toJSON()`
/// produces are accepted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateData {
    pub candidate: String,
    #[serde(default, alias = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, alias = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE server configuration handed to browsers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Snapshot of the relay, served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStatusData {
    pub producer: Option<ProducerStatusData>,
    pub consumers: usize,
    pub pending_clients: usize,
    pub current_track_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerStatusData {
    pub client_id: Uuid,
    pub started_at: DateTime<Utc>,
}
