//! Track liveness monitor
//!
//! Browsers report track readiness asynchronously and out of order with the
//! offer/answer handshake: a track can show up before it carries frames, and
//! the track being relayed can end while a replacement is still starting.
//! The monitor is polled with snapshots of the producer's inbound tracks and
//! decides which track should be the current live one. Every waiting state
//! carries an attempt counter, so the monitor always settles.

use crate::media::{LivenessState, TrackKind, TrackSnapshot};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSettings {
    pub poll_interval: Duration,
    /// Polls spent looking for a replacement before giving up
    pub max_search_attempts: u32,
    /// Polls a not-yet-live track gets before it is treated as never live
    pub max_pending_attempts: u32,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            max_search_attempts: 5,
            max_pending_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    /// No video track seen yet
    Idle,
    PendingLive { track_id: String, attempts: u32 },
    Live { track_id: String },
    SearchingReplacement { attempts: u32 },
    /// Terminal: the stream ended and nothing replaced it
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    None,
    /// Make this track the current live track
    Promote(String),
    /// The current track ended; a replacement is being searched for
    Lost(String),
    /// A track never went live and was discarded
    NeverLive(String),
    /// No replacement turned up; the stream is gone
    GaveUp,
}

#[derive(Debug)]
pub struct LivenessMonitor {
    settings: LivenessSettings,
    state: MonitorState,
    /// Tracks that ended or never went live; never considered again
    discarded: HashSet<String>,
}

impl LivenessMonitor {
    pub fn new(settings: LivenessSettings) -> Self {
        Self {
            settings,
            state: MonitorState::Idle,
            discarded: HashSet::new(),
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == MonitorState::GaveUp
    }

    /// Advance the state machine with the producer's current tracks
    pub fn poll(&mut self, tracks: &[TrackSnapshot]) -> MonitorAction {
        for track in tracks {
            if track.kind == TrackKind::Video && track.liveness == LivenessState::Ended {
                self.discarded.insert(track.id.clone());
            }
        }

        match self.state.clone() {
            MonitorState::Idle => self.poll_idle(tracks),
            MonitorState::PendingLive { track_id, attempts } => {
                if let Some(live) = self.find_live(tracks) {
                    return self.promote(live);
                }
                match liveness_of(tracks, &track_id) {
                    Some(LivenessState::PendingLive) => {
                        let attempts = attempts + 1;
                        if attempts >= self.settings.max_pending_attempts {
                            tracing::warn!(
                                "Track {} did not go live after {} polls",
                                track_id,
                                attempts
                            );
                            self.discarded.insert(track_id.clone());
                            self.state = MonitorState::Idle;
                            return MonitorAction::NeverLive(track_id);
                        }
                        self.state = MonitorState::PendingLive { track_id, attempts };
                        MonitorAction::None
                    }
                    _ => {
                        tracing::debug!("Pending track {} ended before going live", track_id);
                        self.discarded.insert(track_id);
                        self.poll_idle(tracks)
                    }
                }
            }
            MonitorState::Live { track_id } => {
                if liveness_of(tracks, &track_id) == Some(LivenessState::Live) {
                    return MonitorAction::None;
                }

                tracing::info!("Current track {} is no longer live", track_id);
                self.discarded.insert(track_id.clone());

                if let Some(live) = self.find_live(tracks) {
                    return self.promote(live);
                }
                self.state = MonitorState::SearchingReplacement { attempts: 0 };
                MonitorAction::Lost(track_id)
            }
            MonitorState::SearchingReplacement { attempts } => {
                if let Some(live) = self.find_live(tracks) {
                    return self.promote(live);
                }

                let attempts = attempts + 1;
                if attempts >= self.settings.max_search_attempts {
                    tracing::warn!("No replacement track after {} polls, giving up", attempts);
                    self.state = MonitorState::GaveUp;
                    return MonitorAction::GaveUp;
                }
                self.state = MonitorState::SearchingReplacement { attempts };
                MonitorAction::None
            }
            MonitorState::GaveUp => MonitorAction::None,
        }
    }

    fn poll_idle(&mut self, tracks: &[TrackSnapshot]) -> MonitorAction {
        if let Some(live) = self.find_live(tracks) {
            return self.promote(live);
        }

        let pending = tracks.iter().find(|t| {
            t.kind == TrackKind::Video
                && t.liveness == LivenessState::PendingLive
                && !self.discarded.contains(&t.id)
        });
        self.state = match pending {
            Some(track) => MonitorState::PendingLive {
                track_id: track.id.clone(),
                attempts: 0,
            },
            None => MonitorState::Idle,
        };
        MonitorAction::None
    }

    fn find_live(&self, tracks: &[TrackSnapshot]) -> Option<String> {
        tracks
            .iter()
            .find(|t| {
                t.kind == TrackKind::Video
                    && t.liveness == LivenessState::Live
                    && !self.discarded.contains(&t.id)
            })
            .map(|t| t.id.clone())
    }

    fn promote(&mut self, track_id: String) -> MonitorAction {
        self.state = MonitorState::Live {
            track_id: track_id.clone(),
        };
        MonitorAction::Promote(track_id)
    }
}

fn liveness_of(tracks: &[TrackSnapshot], track_id: &str) -> Option<LivenessState> {
    tracks.iter().find(|t| t.id == track_id).map(|t| t.liveness)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> LivenessSettings {
        LivenessSettings {
            poll_interval: Duration::from_millis(10),
            max_search_attempts: 3,
            max_pending_attempts: 4,
        }
    }

    fn snap(id: &str, kind: TrackKind, liveness: LivenessState) -> TrackSnapshot {
        TrackSnapshot {
            id: id.to_string(),
            kind,
            liveness,
            enabled: true,
        }
    }

    fn video(id: &str, liveness: LivenessState) -> TrackSnapshot {
        snap(id, TrackKind::Video, liveness)
    }

    #[test]
    fn promotes_first_live_video_track() {
        let mut monitor = LivenessMonitor::new(settings());
        let tracks = [
            snap("a1", TrackKind::Audio, LivenessState::Live),
            video("v1", LivenessState::Live),
        ];

        assert_eq!(monitor.poll(&tracks), MonitorAction::Promote("v1".into()));
        assert_eq!(monitor.poll(&tracks), MonitorAction::None);
        assert_eq!(
            monitor.state(),
            &MonitorState::Live {
                track_id: "v1".into()
            }
        );
    }

    #[test]
    fn audio_only_stays_idle() {
        let mut monitor = LivenessMonitor::new(settings());
        let tracks = [snap("a1", TrackKind::Audio, LivenessState::Live)];

        assert_eq!(monitor.poll(&tracks), MonitorAction::None);
        assert_eq!(monitor.state(), &MonitorState::Idle);
    }

    #[test]
    fn pending_track_is_promoted_once_live() {
        let mut monitor = LivenessMonitor::new(settings());

        assert_eq!(
            monitor.poll(&[video("v1", LivenessState::PendingLive)]),
            MonitorAction::None
        );
        assert!(matches!(monitor.state(), MonitorState::PendingLive { .. }));
        assert_eq!(
            monitor.poll(&[video("v1", LivenessState::PendingLive)]),
            MonitorAction::None
        );
        assert_eq!(
            monitor.poll(&[video("v1", LivenessState::Live)]),
            MonitorAction::Promote("v1".into())
        );
    }

    #[test]
    fn pending_track_that_ends_is_discarded() {
        let mut monitor = LivenessMonitor::new(settings());
        monitor.poll(&[video("v1", LivenessState::PendingLive)]);

        assert_eq!(
            monitor.poll(&[video("v1", LivenessState::Ended)]),
            MonitorAction::None
        );
        assert_eq!(monitor.state(), &MonitorState::Idle);
    }

    #[test]
    fn pending_track_gives_up_after_bounded_polls() {
        let mut monitor = LivenessMonitor::new(settings());
        let tracks = [video("v1", LivenessState::PendingLive)];

        monitor.poll(&tracks);
        for _ in 0..3 {
            assert_eq!(monitor.poll(&tracks), MonitorAction::None);
        }
        assert_eq!(monitor.poll(&tracks), MonitorAction::NeverLive("v1".into()));
        assert_eq!(monitor.state(), &MonitorState::Idle);

        // A discarded track is not picked up again, even if it goes live late
        assert_eq!(
            monitor.poll(&[video("v1", LivenessState::Live)]),
            MonitorAction::None
        );
    }

    #[test]
    fn ended_track_is_replaced_by_live_one() {
        let mut monitor = LivenessMonitor::new(settings());
        monitor.poll(&[video("t1", LivenessState::Live)]);

        assert_eq!(
            monitor.poll(&[video("t1", LivenessState::Ended)]),
            MonitorAction::Lost("t1".into())
        );
        assert_eq!(
            monitor.poll(&[
                video("t1", LivenessState::Ended),
                video("t2", LivenessState::PendingLive)
            ]),
            MonitorAction::None
        );
        assert_eq!(
            monitor.poll(&[
                video("t1", LivenessState::Ended),
                video("t2", LivenessState::Live)
            ]),
            MonitorAction::Promote("t2".into())
        );
    }

    #[test]
    fn replacement_present_at_loss_is_promoted_immediately() {
        let mut monitor = LivenessMonitor::new(settings());
        monitor.poll(&[video("t1", LivenessState::Live)]);

        assert_eq!(
            monitor.poll(&[
                video("t1", LivenessState::Ended),
                video("t2", LivenessState::Live)
            ]),
            MonitorAction::Promote("t2".into())
        );
    }

    #[test]
    fn missing_track_counts_as_ended() {
        let mut monitor = LivenessMonitor::new(settings());
        monitor.poll(&[video("t1", LivenessState::Live)]);

        assert_eq!(monitor.poll(&[]), MonitorAction::Lost("t1".into()));
    }

    #[test]
    fn search_gives_up_after_bounded_attempts() {
        let mut monitor = LivenessMonitor::new(settings());
        let ended = [video("t1", LivenessState::Ended)];
        monitor.poll(&[video("t1", LivenessState::Live)]);

        assert_eq!(monitor.poll(&ended), MonitorAction::Lost("t1".into()));
        assert_eq!(monitor.poll(&ended), MonitorAction::None);
        assert_eq!(monitor.poll(&ended), MonitorAction::None);
        assert_eq!(monitor.poll(&ended), MonitorAction::GaveUp);
        assert!(monitor.is_finished());

        // Terminal
        assert_eq!(
            monitor.poll(&[video("t2", LivenessState::Live)]),
            MonitorAction::None
        );
    }

    #[test]
    fn ended_track_never_comes_back() {
        let mut monitor = LivenessMonitor::new(settings());
        monitor.poll(&[video("t1", LivenessState::Live)]);
        monitor.poll(&[video("t1", LivenessState::Ended)]);

        // A stale snapshot reporting t1 live again must not resurrect it
        assert_eq!(
            monitor.poll(&[video("t1", LivenessState::Live)]),
            MonitorAction::None
        );
    }
}
