//! Producer and consumer sessions
//!
//! Each session wraps exactly one peer connection. The signaling state is
//! tracked here rather than queried from the media runtime, so every
//! operation can be checked against it before touching the connection.

use super::candidates::CandidateQueue;
use crate::error::{RelayError, Result};
use crate::media::{
    ConnectivityState, PeerConnection, SessionDescription, SignalingState, Track,
};
use chrono::{DateTime, Utc};
use relayhub_protocol::IceCandidateData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub type SessionId = u64;

struct SessionInner {
    signaling: SignalingState,
    connectivity: ConnectivityState,
    candidates: CandidateQueue,
}

/// State shared by both roles: one peer connection, its signaling and
/// connectivity state, its candidate queue and its background tasks
pub struct PeerSession {
    id: SessionId,
    client_id: Uuid,
    pc: Arc<dyn PeerConnection>,
    /// Held across connection calls so operations on one session never interleave
    inner: Mutex<SessionInner>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerSession {
    fn new(id: SessionId, client_id: Uuid, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            id,
            client_id,
            pc,
            inner: Mutex::new(SessionInner {
                signaling: SignalingState::Stable,
                connectivity: ConnectivityState::New,
                candidates: CandidateQueue::new(),
            }),
            tasks: std::sync::Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn signaling_state(&self) -> SignalingState {
        if self.is_closed() {
            return SignalingState::Closed;
        }
        self.inner.lock().await.signaling
    }

    pub async fn connectivity_state(&self) -> ConnectivityState {
        if self.is_closed() {
            return ConnectivityState::Closed;
        }
        self.inner.lock().await.connectivity
    }

    pub async fn set_connectivity(&self, state: ConnectivityState) {
        let mut inner = self.inner.lock().await;
        if inner.connectivity != state {
            tracing::debug!(
                "Session {} connectivity {:?} -> {:?}",
                self.id,
                inner.connectivity,
                state
            );
            inner.connectivity = state;
        }
    }

    /// Apply a remote candidate now, or queue it until the remote description
    /// is set. A candidate the connection rejects is logged and dropped.
    pub async fn add_candidate(&self, candidate: IceCandidateData) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.is_closed() {
            return Err(closed_error("open"));
        }

        if let Some(candidate) = inner.candidates.enqueue(candidate) {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                tracing::warn!("Session {}: {}", self.id, e);
            }
        } else {
            tracing::debug!(
                "Session {} queued ICE candidate ({} pending)",
                self.id,
                inner.candidates.len()
            );
        }
        Ok(())
    }

    /// Replay candidates queued before the remote description was set
    async fn flush_candidates(&self, inner: &mut SessionInner) {
        let report = inner.candidates.flush(self.pc.as_ref()).await;
        if report.failed > 0 {
            tracing::warn!(
                "Session {} dropped {} of {} queued candidates",
                self.id,
                report.failed,
                report.applied + report.failed
            );
        } else if report.applied > 0 {
            tracing::debug!("Session {} applied {} queued candidates", self.id, report.applied);
        }
    }

    /// Tie a background task to this session; it is aborted on close
    pub fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            handle.abort();
            return;
        }
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Mark the session closed and abort its tasks without waiting.
    ///
    /// Returns false if it was already closed.
    pub fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        true
    }

    /// Close the session and its connection. Idempotent.
    pub async fn close(&self) {
        self.shutdown();
        self.pc.close().await;

        let mut inner = self.inner.lock().await;
        inner.signaling = SignalingState::Closed;
        inner.connectivity = ConnectivityState::Closed;
        let dropped = inner.candidates.clear();
        if dropped > 0 {
            tracing::debug!("Session {} dropped {} queued candidates", self.id, dropped);
        }
    }

    fn check_signaling(
        &self,
        inner: &SessionInner,
        expected: SignalingState,
        label: &'static str,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error(label));
        }
        if inner.signaling != expected {
            return Err(RelayError::InvalidSignalingState {
                expected: label,
                actual: inner.signaling,
            });
        }
        Ok(())
    }
}

fn closed_error(expected: &'static str) -> RelayError {
    RelayError::InvalidSignalingState {
        expected,
        actual: SignalingState::Closed,
    }
}

/// Session receiving media from the producing client
pub struct ProducerSession {
    peer: PeerSession,
    started_at: DateTime<Utc>,
    tracks: Mutex<Vec<Track>>,
    /// Wakes the liveness monitor ahead of its next scheduled poll
    monitor_wake: Notify,
}

impl ProducerSession {
    pub fn new(id: SessionId, client_id: Uuid, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer: PeerSession::new(id, client_id, pc),
            started_at: Utc::now(),
            tracks: Mutex::new(Vec::new()),
            monitor_wake: Notify::new(),
        }
    }

    pub fn peer(&self) -> &PeerSession {
        &self.peer
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Apply the producer's offer and produce the hub's answer.
    ///
    /// Signaling goes `stable -> have-remote-offer -> stable`.
    pub async fn attach(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let mut inner = self.peer.inner.lock().await;
        self.peer
            .check_signaling(&inner, SignalingState::Stable, "stable")?;

        self.peer.pc.set_remote_description(offer).await?;
        inner.signaling = SignalingState::HaveRemoteOffer;
        self.peer.flush_candidates(&mut inner).await;

        let answer = self.peer.pc.create_answer().await?;
        self.peer.pc.set_local_description(answer.clone()).await?;
        inner.signaling = SignalingState::Stable;

        tracing::info!("Producer session {} answered offer", self.peer.id);
        Ok(answer)
    }

    /// Record an inbound track. Non-live tracks are not promoted here; the
    /// liveness monitor decides once they settle.
    pub async fn on_track_received(&self, track: Track) {
        let mut tracks = self.tracks.lock().await;
        if tracks.iter().any(|t| t.id() == track.id()) {
            return;
        }

        tracing::info!(
            "Producer session {} received {:?} track {} ({})",
            self.peer.id,
            track.kind(),
            track.id(),
            track.liveness()
        );
        tracks.push(track);
        drop(tracks);

        self.wake_monitor();
    }

    /// Current inbound tracks, including any the connection knows about that
    /// were not announced through an event
    pub async fn received_tracks(&self) -> Vec<Track> {
        let mut tracks = self.tracks.lock().await.clone();
        for track in self.peer.pc.inbound_tracks().await {
            if !tracks.iter().any(|t| t.id() == track.id()) {
                tracks.push(track);
            }
        }
        tracks
    }

    pub fn wake_monitor(&self) {
        self.monitor_wake.notify_one();
    }

    pub async fn monitor_woken(&self) {
        self.monitor_wake.notified().await;
    }
}

/// Session sending the current live track to one consuming client
pub struct ConsumerSession {
    peer: PeerSession,
    binding: Mutex<Binding>,
}

#[derive(Default)]
struct Binding {
    track: Option<Track>,
    /// Track to switch to once the in-flight offer is answered
    deferred: Option<Track>,
    /// Incremented for every offer sent
    offer_seq: u64,
}

impl ConsumerSession {
    pub fn new(id: SessionId, client_id: Uuid, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer: PeerSession::new(id, client_id, pc),
            binding: Mutex::new(Binding::default()),
        }
    }

    pub fn peer(&self) -> &PeerSession {
        &self.peer
    }

    pub async fn bound_track(&self) -> Option<Track> {
        self.binding.lock().await.track.clone()
    }

    /// Sequence number of the offer awaiting an answer, if any
    pub async fn pending_offer(&self) -> Option<u64> {
        let inner = self.peer.inner.lock().await;
        if self.peer.is_closed() || inner.signaling != SignalingState::HaveLocalOffer {
            return None;
        }
        Some(self.binding.lock().await.offer_seq)
    }

    /// Bind `track` for sending and produce the offer for the client
    pub async fn create_offer_with_track(&self, track: &Track) -> Result<SessionDescription> {
        ensure_live(track)?;

        let mut inner = self.peer.inner.lock().await;
        self.peer
            .check_signaling(&inner, SignalingState::Stable, "stable")?;

        let offer = self.offer_with(track).await?;
        inner.signaling = SignalingState::HaveLocalOffer;
        Ok(offer)
    }

    /// Apply the client's answer.
    ///
    /// If a rebind was deferred while this answer was outstanding it is
    /// carried out now and the resulting offer is returned for delivery.
    pub async fn apply_answer(&self, answer: SessionDescription) -> Result<Option<SessionDescription>> {
        let mut inner = self.peer.inner.lock().await;
        self.peer
            .check_signaling(&inner, SignalingState::HaveLocalOffer, "have-local-offer")?;

        self.peer.pc.set_remote_description(answer).await?;
        inner.signaling = SignalingState::Stable;
        self.peer.flush_candidates(&mut inner).await;

        let deferred = self.binding.lock().await.deferred.take();
        match deferred {
            Some(track) if track.is_live() => {
                tracing::info!(
                    "Consumer session {} applying deferred rebind to {}",
                    self.peer.id,
                    track.id()
                );
                let offer = self.offer_with(&track).await?;
                inner.signaling = SignalingState::HaveLocalOffer;
                Ok(Some(offer))
            }
            Some(track) => {
                tracing::debug!(
                    "Consumer session {} dropping deferred rebind to {} ({})",
                    self.peer.id,
                    track.id(),
                    track.liveness()
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Switch the outbound track.
    ///
    /// The new track only reaches the client after another offer/answer
    /// round, so this returns the offer to deliver. While an earlier offer is
    /// still unanswered the switch is deferred until that answer arrives and
    /// `None` is returned.
    pub async fn rebind(&self, track: &Track) -> Result<Option<SessionDescription>> {
        ensure_live(track)?;

        let mut inner = self.peer.inner.lock().await;
        if self.peer.is_closed() {
            return Err(closed_error("stable"));
        }

        {
            let mut binding = self.binding.lock().await;
            if binding.track.as_ref().map(|t| t.id()) == Some(track.id()) {
                binding.deferred = None;
                return Ok(None);
            }
            if inner.signaling == SignalingState::HaveLocalOffer {
                binding.deferred = Some(track.clone());
                return Ok(None);
            }
        }

        self.peer
            .check_signaling(&inner, SignalingState::Stable, "stable")?;
        let offer = self.offer_with(track).await?;
        inner.signaling = SignalingState::HaveLocalOffer;
        Ok(Some(offer))
    }

    async fn offer_with(&self, track: &Track) -> Result<SessionDescription> {
        self.peer.pc.bind_outbound_track(track).await?;

        let offer = self.peer.pc.create_offer().await?;
        self.peer.pc.set_local_description(offer.clone()).await?;

        let mut binding = self.binding.lock().await;
        binding.track = Some(track.clone());
        binding.offer_seq += 1;

        tracing::info!(
            "Consumer session {} offering track {} (offer #{})",
            self.peer.id,
            track.id(),
            binding.offer_seq
        );
        Ok(offer)
    }
}

fn ensure_live(track: &Track) -> Result<()> {
    if !track.is_live() {
        return Err(RelayError::TrackNotLive {
            track_id: track.id().to_string(),
            liveness: track.liveness(),
        });
    }
    Ok(())
}
