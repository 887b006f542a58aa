use thiserror::Error;

use crate::media::{LivenessState, SignalingState};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid signaling state: expected {expected}, found {actual}")]
    InvalidSignalingState {
        expected: &'static str,
        actual: SignalingState,
    },

    #[error("Track {track_id} is not live ({liveness})")]
    TrackNotLive {
        track_id: String,
        liveness: LivenessState,
    },

    #[error("No media runtime available")]
    NoMediaRuntime,

    #[error("Failed to apply ICE candidate: {0}")]
    CandidateApplication(String),
}

impl RelayError {
    /// Errors after which the affected session cannot continue
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, RelayError::Negotiation(_) | RelayError::NoMediaRuntime)
    }
}

impl From<webrtc::Error> for RelayError {
    fn from(e: webrtc::Error) -> Self {
        RelayError::Negotiation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
