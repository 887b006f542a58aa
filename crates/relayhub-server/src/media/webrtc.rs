//! `webrtc` crate backed media runtime

use super::{
    ConnectivityState, MediaRuntime, PeerConnection, PeerEvent, PeerEventSender, SdpType,
    SessionDescription, Track, TrackRouter,
};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use relayhub_protocol::IceCandidateData;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Inbound tracks of every live producer connection, keyed by track id
type RouterRegistry = Arc<RwLock<HashMap<String, Arc<TrackRouter>>>>;

#[derive(Debug, Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// Media runtime that terminates real WebRTC peer connections
pub struct WebrtcRuntime {
    /// WebRTC API (shared for all connections)
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    routers: RouterRegistry,
}

impl WebrtcRuntime {
    pub fn new(stun_servers: &[String], turn_servers: &[TurnServer]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        // Consumers are offered whatever codec the producer negotiated, so
        // every codec a browser may pick has to be known here.
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let mut ice_servers = vec![];

        for stun_url in stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            routers: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

#[async_trait]
impl MediaRuntime for WebrtcRuntime {
    async fn create_connection(&self, events: PeerEventSender) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let id = Uuid::new_v4();
        let inbound: Arc<RwLock<Vec<Arc<TrackRouter>>>> = Arc::new(RwLock::new(Vec::new()));

        let events_clone = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = events_clone.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = events.send(PeerEvent::LocalCandidate(IceCandidateData {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            }));
                        }
                        Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                    }
                }
            })
        }));

        let events_clone = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events_clone.clone();
            Box::pin(async move {
                let state = match state {
                    RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectivityState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectivityState::Failed,
                    RTCPeerConnectionState::Closed => ConnectivityState::Closed,
                    _ => ConnectivityState::New,
                };
                let _ = events.send(PeerEvent::ConnectivityChanged(state));
            })
        }));

        let routers = self.routers.clone();
        let inbound_clone = inbound.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let routers = routers.clone();
            let inbound = inbound_clone.clone();
            let events = events.clone();

            Box::pin(async move {
                let router = Arc::new(TrackRouter::new(track));
                tracing::info!(
                    "Received {:?} track {} on connection {}",
                    router.track().kind(),
                    router.track_id(),
                    id
                );

                routers
                    .write()
                    .await
                    .insert(router.track_id().to_string(), router.clone());
                inbound.write().await.push(router.clone());

                let _ = events.send(PeerEvent::TrackReceived(router.track().clone()));

                tokio::spawn(router.start_forwarding());
            })
        }));

        tracing::debug!("Created peer connection {}", id);

        Ok(Arc::new(WebrtcPeer {
            id,
            pc,
            routers: self.routers.clone(),
            inbound,
            outbound: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

struct OutboundBinding {
    sender: Arc<RTCRtpSender>,
    router: Arc<TrackRouter>,
}

struct WebrtcPeer {
    /// Subscriber key used with track routers
    id: Uuid,
    pc: Arc<RTCPeerConnection>,
    routers: RouterRegistry,
    inbound: Arc<RwLock<Vec<Arc<TrackRouter>>>>,
    outbound: Mutex<Option<OutboundBinding>>,
    closed: AtomicBool,
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(RelayError::Negotiation(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

#[async_trait]
impl PeerConnection for WebrtcPeer {
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let m_line_count = desc.sdp.lines().filter(|l| l.starts_with("m=")).count();
        tracing::debug!("Setting remote description with {} m-lines on {}", m_line_count, self.id);

        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RelayError::CandidateApplication(e.to_string()))
    }

    async fn bind_outbound_track(&self, track: &Track) -> Result<()> {
        let router = self
            .routers
            .read()
            .await
            .get(track.id())
            .cloned()
            .ok_or_else(|| {
                RelayError::Negotiation(format!("track {} has no active router", track.id()))
            })?;

        let mut outbound = self.outbound.lock().await;

        if let Some(binding) = outbound.as_mut() {
            if binding.router.track_id() == router.track_id() {
                return Ok(());
            }

            let local_track = router.add_subscriber(self.id).await;
            binding
                .sender
                .replace_track(Some(local_track as Arc<dyn TrackLocal + Send + Sync>))
                .await?;
            binding.router.remove_subscriber(self.id).await;
            binding.router = router;
            return Ok(());
        }

        let local_track = router.add_subscriber(self.id).await;
        let sender = self
            .pc
            .add_track(local_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for the interceptors (NACK, reports) to work
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        *outbound = Some(OutboundBinding { sender, router });
        Ok(())
    }

    async fn inbound_tracks(&self) -> Vec<Track> {
        self.inbound
            .read()
            .await
            .iter()
            .map(|router| router.track().clone())
            .collect()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection {}: {}", self.id, e);
        }

        let inbound: Vec<_> = self.inbound.write().await.drain(..).collect();
        if !inbound.is_empty() {
            let mut routers = self.routers.write().await;
            for router in inbound {
                router.stop();
                routers.remove(router.track_id());
            }
        }

        if let Some(binding) = self.outbound.lock().await.take() {
            binding.router.remove_subscriber(self.id).await;
        }

        tracing::debug!("Closed peer connection {}", self.id);
    }
}
