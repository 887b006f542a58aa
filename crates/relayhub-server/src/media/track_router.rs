//! Track Router for RTP forwarding
//!
//! Routes RTP packets from the producer's inbound track to every consumer
//! bound to it. Uses TrackLocalStaticRTP for direct RTP forwarding so packets
//! are relayed exactly as received (no decode, no re-encode).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

use super::{LivenessState, Track, TrackKind, TrackSource};

/// Waits for a first packet before a track is declared ended
const MAX_STARTUP_TIMEOUTS: u32 = 30;
const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(2);
/// Retries while the RTP receiver is still being attached
const MAX_RECEIVER_RETRIES: u32 = 50;

enum ReadFailure {
    Closed,
    /// `on_track` can fire before the receiver is wired up
    ReceiverNotReady,
    Other,
}

impl ReadFailure {
    fn classify(error: &webrtc::Error) -> Self {
        let text = error.to_string();
        if text.contains("closed") || text.contains("EOF") {
            ReadFailure::Closed
        } else if text.contains("RTPReceiver must not be nil") {
            ReadFailure::ReceiverNotReady
        } else {
            ReadFailure::Other
        }
    }
}

/// Routes RTP packets from a source track to multiple subscriber tracks
pub struct TrackRouter {
    /// The inbound track from the producer
    source_track: Arc<TrackRemote>,
    /// Hub-facing handle whose liveness this router drives
    track: Track,
    liveness: TrackSource,
    /// Local tracks per subscribing peer connection
    subscriber_tracks: RwLock<HashMap<Uuid, Arc<TrackLocalStaticRTP>>>,
}

impl TrackRouter {
    pub fn new(source_track: Arc<TrackRemote>) -> Self {
        let kind = match source_track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        let (liveness, track) =
            Track::channel(source_track.id(), kind, LivenessState::PendingLive);

        Self {
            source_track,
            track,
            liveness,
            subscriber_tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Hub-facing handle for the routed track
    pub fn track(&self) -> &Track {
        &self.track
    }

    pub fn track_id(&self) -> &str {
        self.track.id()
    }

    /// Relay packets until the source closes or the router is stopped.
    ///
    /// The track stays pending-live until the first packet arrives.
    pub async fn start_forwarding(self: Arc<Self>) {
        tracing::info!("Forwarding RTP for track {}", self.track_id());

        let mut forwarded = 0u64;
        let mut startup_timeouts = 0u32;
        let mut receiver_retries = 0u32;

        while self.liveness.current() != LivenessState::Ended {
            let read = if forwarded == 0 {
                match tokio::time::timeout(FIRST_PACKET_TIMEOUT, self.source_track.read_rtp()).await
                {
                    Ok(read) => read,
                    Err(_) => {
                        startup_timeouts += 1;
                        if startup_timeouts > MAX_STARTUP_TIMEOUTS {
                            tracing::error!(
                                "Track {} never received packets after {} waits",
                                self.track_id(),
                                startup_timeouts
                            );
                            break;
                        }
                        if startup_timeouts % 5 == 1 {
                            tracing::warn!(
                                "No RTP on track {} yet ({} waits)",
                                self.track_id(),
                                startup_timeouts
                            );
                        }
                        continue;
                    }
                }
            } else {
                self.source_track.read_rtp().await
            };

            match read {
                Ok((packet, _attributes)) => {
                    if forwarded == 0 {
                        tracing::info!(
                            "Track {} is live, first payload {} bytes",
                            self.track_id(),
                            packet.payload.len()
                        );
                        self.liveness.mark_live();
                    }
                    forwarded += 1;
                    self.forward_packet(&packet).await;
                }
                Err(e) => match ReadFailure::classify(&e) {
                    ReadFailure::Closed => {
                        tracing::info!(
                            "Source of track {} closed after {} packets",
                            self.track_id(),
                            forwarded
                        );
                        break;
                    }
                    ReadFailure::ReceiverNotReady => {
                        receiver_retries += 1;
                        if forwarded == 0 && receiver_retries > MAX_RECEIVER_RETRIES {
                            tracing::error!("Receiver for track {} never attached", self.track_id());
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    ReadFailure::Other => {
                        if forwarded % 100 == 0 {
                            tracing::warn!("RTP read error on track {}: {}", self.track_id(), e);
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        self.liveness.mark_ended();
    }

    /// Forward an RTP packet to all subscribers
    async fn forward_packet(&self, rtp_packet: &webrtc::rtp::packet::Packet) {
        let subscribers = self.subscriber_tracks.read().await;

        for (subscriber_id, local_track) in subscribers.iter() {
            if let Err(e) = local_track.write_rtp(rtp_packet).await {
                tracing::debug!(
                    "Failed to forward RTP to subscriber {}: {}",
                    subscriber_id,
                    e
                );
            }
        }
    }

    /// Create the outbound track a subscribing connection sends
    pub async fn add_subscriber(&self, subscriber_id: Uuid) -> Arc<TrackLocalStaticRTP> {
        // The codec negotiated with the producer is registered in the shared
        // MediaEngine, so consumers can be offered the same capability.
        let capability = self.source_track.codec().capability;

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            format!("{}-{}", self.track_id(), subscriber_id),
            "relayhub-stream".to_string(),
        ));

        self.subscriber_tracks
            .write()
            .await
            .insert(subscriber_id, local_track.clone());

        tracing::info!(
            "Added subscriber {} to track {}",
            subscriber_id,
            self.track_id()
        );

        local_track
    }

    pub async fn remove_subscriber(&self, subscriber_id: Uuid) -> bool {
        let removed = self
            .subscriber_tracks
            .write()
            .await
            .remove(&subscriber_id)
            .is_some();

        if removed {
            tracing::info!(
                "Removed subscriber {} from track {}",
                subscriber_id,
                self.track_id()
            );
        }

        removed
    }

    /// Stop forwarding and end the track
    pub fn stop(&self) {
        self.liveness.mark_ended();
        tracing::debug!("Track router {} stopped", self.track_id());
    }
}
