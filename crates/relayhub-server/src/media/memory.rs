//! In-memory media runtime.
//!
//! Peer connections here never touch the network: they record every call the
//! relay makes and let the caller inject tracks, events and failures. Used by
//! the test suite and for running the hub without a WebRTC stack.

use super::{
    ConnectivityState, MediaRuntime, PeerConnection, PeerEvent, PeerEventSender,
    SessionDescription, Track,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use relayhub_protocol::IceCandidateData;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct MemoryRuntime {
    connections: Mutex<Vec<Arc<MemoryPeer>>>,
    next_id: AtomicU64,
    fail_negotiation: AtomicBool,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connection created so far, in creation order
    pub async fn connections(&self) -> Vec<Arc<MemoryPeer>> {
        self.connections.lock().await.clone()
    }

    pub async fn last_connection(&self) -> Option<Arc<MemoryPeer>> {
        self.connections.lock().await.last().cloned()
    }

    /// Connections created from now on reject every description operation
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaRuntime for MemoryRuntime {
    async fn create_connection(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(MemoryPeer {
            id,
            events,
            state: Mutex::new(PeerState::default()),
            rejected_candidates: Mutex::new(HashSet::new()),
            fail_negotiation: AtomicBool::new(self.fail_negotiation.load(Ordering::SeqCst)),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().await.push(peer.clone());
        Ok(peer)
    }
}

#[derive(Default)]
struct PeerState {
    remote_description: Option<SessionDescription>,
    local_description: Option<SessionDescription>,
    applied_candidates: Vec<IceCandidateData>,
    inbound: Vec<Track>,
    bound_tracks: Vec<String>,
    offers_created: u32,
}

/// Recording peer connection
pub struct MemoryPeer {
    id: u64,
    events: PeerEventSender,
    state: Mutex<PeerState>,
    rejected_candidates: Mutex<HashSet<String>>,
    fail_negotiation: AtomicBool,
    closed: AtomicBool,
}

impl MemoryPeer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an inbound track, as a browser adding media would
    pub async fn receive_track(&self, track: Track) {
        self.state.lock().await.inbound.push(track.clone());
        self.emit(PeerEvent::TrackReceived(track));
    }

    pub fn set_connectivity(&self, state: ConnectivityState) {
        self.emit(PeerEvent::ConnectivityChanged(state));
    }

    pub fn gather_candidate(&self, candidate: IceCandidateData) {
        self.emit(PeerEvent::LocalCandidate(candidate));
    }

    /// Make `add_ice_candidate` fail for this candidate string
    pub async fn reject_candidate(&self, candidate: &str) {
        self.rejected_candidates
            .lock()
            .await
            .insert(candidate.to_string());
    }

    /// Make every following description operation fail
    pub fn fail_negotiation(&self) {
        self.fail_negotiation.store(true, Ordering::SeqCst);
    }

    pub async fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .applied_candidates
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().await.remote_description.clone()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().await.local_description.clone()
    }

    /// Ids of the tracks bound for sending, oldest first
    pub async fn bound_tracks(&self) -> Vec<String> {
        self.state.lock().await.bound_tracks.clone()
    }

    fn emit(&self, event: PeerEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Memory peer {} has no event listener", self.id);
        }
    }

    fn check_negotiation(&self, op: &str) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::Negotiation(format!("{} on closed connection", op)));
        }
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(RelayError::Negotiation(format!("{} rejected", op)));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for MemoryPeer {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        // Real stacks suspend here; give other tasks a chance to interleave
        tokio::task::yield_now().await;
        self.check_negotiation("set_remote_description")?;
        self.state.lock().await.remote_description = Some(desc);
        Ok(())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        tokio::task::yield_now().await;
        self.check_negotiation("set_local_description")?;
        self.state.lock().await.local_description = Some(desc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.check_negotiation("create_offer")?;
        let mut state = self.state.lock().await;
        state.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 memory-offer peer={} n={}",
            self.id, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_negotiation("create_answer")?;
        Ok(SessionDescription::answer(format!("v=0 memory-answer peer={}", self.id)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()> {
        tokio::task::yield_now().await;
        if self
            .rejected_candidates
            .lock()
            .await
            .contains(&candidate.candidate)
        {
            return Err(RelayError::CandidateApplication(candidate.candidate));
        }
        self.state.lock().await.applied_candidates.push(candidate);
        Ok(())
    }

    async fn bind_outbound_track(&self, track: &Track) -> Result<()> {
        self.check_negotiation("bind_outbound_track")?;
        self.state
            .lock()
            .await
            .bound_tracks
            .push(track.id().to_string());
        Ok(())
    }

    async fn inbound_tracks(&self) -> Vec<Track> {
        self.state.lock().await.inbound.clone()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
