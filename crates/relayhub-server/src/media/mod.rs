//! Media runtime seam
//!
//! The relay core never talks to a WebRTC stack directly. It goes through the
//! [`MediaRuntime`] and [`PeerConnection`] traits, which the `webrtc` crate
//! backed runtime implements for production and [`memory::MemoryRuntime`]
//! implements for tests.

pub mod memory;
mod track;
mod track_router;
pub mod webrtc;

pub use track::{LivenessState, Track, TrackKind, TrackSnapshot, TrackSource};
pub use track_router::TrackRouter;

use crate::error::Result;
use async_trait::async_trait;
use relayhub_protocol::IceCandidateData;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// A negotiated media description exchanged during offer/answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalingState::Stable => "stable",
            SignalingState::HaveLocalOffer => "have-local-offer",
            SignalingState::HaveRemoteOffer => "have-remote-offer",
            SignalingState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications raised by a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and must be trickled to the client
    LocalCandidate(IceCandidateData),
    ConnectivityChanged(ConnectivityState),
    /// An inbound track arrived; it may not be live yet
    TrackReceived(Track),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One peer connection owned by the hub
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()>;

    /// Send `track` on this connection, replacing any previous outbound track
    async fn bind_outbound_track(&self, track: &Track) -> Result<()>;

    /// Tracks received so far on this connection
    async fn inbound_tracks(&self) -> Vec<Track>;

    /// Close the connection. Calling it more than once is harmless.
    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait MediaRuntime: Send + Sync {
    async fn create_connection(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>>;
}
