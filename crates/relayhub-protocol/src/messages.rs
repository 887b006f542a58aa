use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClientRole, IceCandidateData};

/// Messages sent from client to hub via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Client consents to join; the hub begins admission
    ConnectionAccept {
        #[serde(default)]
        role: ClientRole,
    },

    /// Client declines; the hub drops the client
    ConnectionReject,

    /// Producer proposes to send media
    Offer { sdp: String },

    /// Consumer answers an offer made by the hub
    Answer { sdp: String },

    /// Trickled ICE candidate
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidateData,
    },
}

/// Messages sent from hub to client via WebSocket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Client may proceed with its role-specific negotiation
    StartWebrtc,

    /// Hub proposes to send media to a consumer
    Offer { sdp: String },

    /// Hub's answer to a producer offer
    Answer { sdp: String },

    /// Trickled ICE candidate gathered by the hub
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidateData,
    },

    /// Non-fatal notice
    Error { message: String },

    /// Whether a live stream is currently being relayed
    StreamStatus { live: bool },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
