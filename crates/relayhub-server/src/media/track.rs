use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LivenessState {
    /// Received but not producing frames yet
    PendingLive,
    Live,
    Ended,
}

impl fmt::Display for LivenessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LivenessState::PendingLive => "pending-live",
            LivenessState::Live => "live",
            LivenessState::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a track, as seen by the liveness monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSnapshot {
    pub id: String,
    pub kind: TrackKind,
    pub liveness: LivenessState,
    pub enabled: bool,
}

/// Read-only handle to a media track owned by the media runtime.
///
/// Liveness is driven by the matching [`TrackSource`]; holders of a `Track`
/// can observe it but never change it.
#[derive(Debug, Clone)]
pub struct Track {
    id: Arc<str>,
    kind: TrackKind,
    enabled: bool,
    liveness: watch::Receiver<LivenessState>,
}

/// Writer side of a track's liveness, kept by whoever receives the media
#[derive(Debug)]
pub struct TrackSource {
    liveness: watch::Sender<LivenessState>,
}

impl Track {
    /// Create a track together with the source that drives its liveness
    pub fn channel(
        id: impl Into<Arc<str>>,
        kind: TrackKind,
        initial: LivenessState,
    ) -> (TrackSource, Track) {
        let (tx, rx) = watch::channel(initial);
        let track = Track {
            id: id.into(),
            kind,
            enabled: true,
            liveness: rx,
        };
        (TrackSource { liveness: tx }, track)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn liveness(&self) -> LivenessState {
        *self.liveness.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.liveness() == LivenessState::Live
    }

    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            id: self.id.to_string(),
            kind: self.kind,
            liveness: self.liveness(),
            enabled: self.enabled,
        }
    }

    /// Wait for the next liveness transition.
    ///
    /// Returns `None` once the source is gone and no further change can happen.
    pub async fn next_liveness(&mut self) -> Option<LivenessState> {
        self.liveness.changed().await.ok()?;
        Some(*self.liveness.borrow_and_update())
    }
}

impl TrackSource {
    pub fn set(&self, state: LivenessState) {
        // Ended is terminal
        self.liveness.send_if_modified(|current| {
            if *current == state || *current == LivenessState::Ended {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn mark_live(&self) {
        self.set(LivenessState::Live);
    }

    pub fn mark_ended(&self) {
        self.set(LivenessState::Ended);
    }

    pub fn current(&self) -> LivenessState {
        *self.liveness.borrow()
    }
}

impl Drop for TrackSource {
    fn drop(&mut self) {
        self.mark_ended();
    }
}
