use super::liveness::{LivenessMonitor, LivenessSettings, MonitorAction};
use super::session::{ConsumerSession, PeerSession, ProducerSession, SessionId};
use crate::error::{RelayError, Result};
use crate::media::{
    ConnectivityState, LivenessState, MediaRuntime, PeerEvent, SessionDescription,
    SignalingState, Track,
};
use crate::ws::connections::ConnectionManager;
use relayhub_protocol::{
    ClientMessage, ClientRole, IceCandidateData, ProducerStatusData, RelayStatusData,
    ServerMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Delay between a consumer joining and its first offer
    pub settle_delay: Duration,
    /// How long a consumer offer may stay unanswered
    pub negotiation_timeout: Duration,
    pub liveness: LivenessSettings,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            negotiation_timeout: Duration::from_secs(15),
            liveness: LivenessSettings::default(),
        }
    }
}

/// Lifecycle notifications, in the order the hub committed them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    ProducerCreated {
        session_id: SessionId,
        client_id: Uuid,
    },
    ProducerClosed {
        session_id: SessionId,
        client_id: Uuid,
    },
    ConsumerCreated {
        session_id: SessionId,
        client_id: Uuid,
        track_id: String,
    },
    ConsumerClosed {
        session_id: SessionId,
        client_id: Uuid,
    },
    TrackPromoted {
        track_id: String,
    },
    TrackCleared,
    /// The producer's track ended and no replacement appeared
    StreamLost,
}

/// What the transport should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Pending,
    Admitting,
    Admitted,
}

struct ClientEntry {
    role: ClientRole,
    admission: Admission,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<Uuid, ClientEntry>,
    producer: Option<Arc<ProducerSession>>,
    consumers: HashMap<Uuid, Arc<ConsumerSession>>,
    current_track: Option<Track>,
    next_session_id: SessionId,
}

impl HubState {
    fn allocate_session_id(&mut self) -> SessionId {
        self.next_session_id += 1;
        self.next_session_id
    }

    fn producer_is(&self, session_id: SessionId) -> bool {
        self.producer
            .as_ref()
            .is_some_and(|p| p.peer().id() == session_id)
    }

    /// `track` is the current live track and comes from producer `session_id`
    fn serves(&self, session_id: SessionId, track: &Track) -> bool {
        self.producer_is(session_id)
            && self
                .current_track
                .as_ref()
                .is_some_and(|t| t.id() == track.id())
    }

    fn is_producer_client(&self, client_id: Uuid) -> bool {
        self.producer
            .as_ref()
            .is_some_and(|p| p.peer().client_id() == client_id)
    }

    fn consumer_clients(&self) -> Vec<Uuid> {
        self.clients
            .iter()
            .filter(|(_, entry)| entry.role == ClientRole::Consumer)
            .map(|(id, _)| *id)
            .collect()
    }

    fn admission(&self, client_id: Uuid) -> Option<Admission> {
        self.clients.get(&client_id).map(|entry| entry.admission)
    }

    fn set_admission(&mut self, client_id: Uuid, admission: Admission) {
        if let Some(entry) = self.clients.get_mut(&client_id) {
            entry.admission = admission;
        }
    }
}

enum Target {
    Producer(Arc<ProducerSession>),
    Consumer(Arc<ConsumerSession>),
}

impl Target {
    fn peer(&self) -> &PeerSession {
        match self {
            Target::Producer(session) => session.peer(),
            Target::Consumer(session) => session.peer(),
        }
    }
}

/// Owner of the producer session, the consumer sessions and the current live
/// track. All of that state is private and changes only through these methods,
/// inside short critical sections that never span a negotiation await.
pub struct RelayHub {
    runtime: Option<Arc<dyn MediaRuntime>>,
    connections: Arc<ConnectionManager>,
    settings: HubSettings,
    state: Mutex<HubState>,
    events: broadcast::Sender<HubEvent>,
}

impl RelayHub {
    /// `runtime` is `None` when no media stack could be loaded; operations that
    /// need one then fail with [`RelayError::NoMediaRuntime`].
    pub fn new(
        runtime: Option<Arc<dyn MediaRuntime>>,
        connections: Arc<ConnectionManager>,
        settings: HubSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            runtime,
            connections,
            settings,
            state: Mutex::new(HubState::default()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.state.lock().await.current_track.clone()
    }

    pub async fn producer(&self) -> Option<Arc<ProducerSession>> {
        self.state.lock().await.producer.clone()
    }

    pub async fn consumer(&self, client_id: Uuid) -> Option<Arc<ConsumerSession>> {
        self.state.lock().await.consumers.get(&client_id).cloned()
    }

    /// Whether `client_id` is a connected consumer still waiting for a stream
    pub async fn is_pending(&self, client_id: Uuid) -> bool {
        let state = self.state.lock().await;
        state.admission(client_id) == Some(Admission::Pending)
            && !state.consumers.contains_key(&client_id)
    }

    pub async fn status(&self) -> RelayStatusData {
        let state = self.state.lock().await;
        RelayStatusData {
            producer: state.producer.as_ref().map(|p| ProducerStatusData {
                client_id: p.peer().client_id(),
                started_at: p.started_at(),
            }),
            consumers: state.consumers.len(),
            pending_clients: state
                .clients
                .values()
                .filter(|e| e.role == ClientRole::Consumer && e.admission == Admission::Pending)
                .count(),
            current_track_id: state.current_track.as_ref().map(|t| t.id().to_string()),
        }
    }

    /// Route one client message
    pub async fn dispatch(self: &Arc<Self>, client_id: Uuid, message: ClientMessage) -> Dispatch {
        match message {
            ClientMessage::ConnectionAccept { role } => {
                self.on_client_connected(client_id, role).await;
            }
            ClientMessage::ConnectionReject => {
                tracing::info!("Client {} rejected the connection", client_id);
                self.on_client_disconnected(client_id).await;
                return Dispatch::Disconnect;
            }
            ClientMessage::Offer { sdp } => {
                if let Err(e) = self.on_producer_offer(client_id, sdp).await {
                    tracing::debug!("Producer offer from {} not accepted: {}", client_id, e);
                }
            }
            ClientMessage::Answer { sdp } => {
                if let Err(e) = self.on_consumer_answer(client_id, sdp).await {
                    tracing::debug!("Answer from {} not applied: {}", client_id, e);
                }
            }
            ClientMessage::IceCandidate { candidate } => {
                self.on_candidate(client_id, candidate).await;
            }
        }
        Dispatch::Continue
    }

    pub async fn on_client_connected(self: &Arc<Self>, client_id: Uuid, role: ClientRole) {
        let has_stream = {
            let mut state = self.state.lock().await;
            state
                .clients
                .entry(client_id)
                .and_modify(|entry| entry.role = role)
                .or_insert(ClientEntry {
                    role,
                    admission: Admission::Pending,
                });
            state.current_track.is_some()
        };

        tracing::info!("Client {} joined as {:?}", client_id, role);
        self.send(client_id, &ServerMessage::StartWebrtc).await;

        if role == ClientRole::Producer {
            return;
        }

        if has_stream {
            self.schedule_admission(client_id, self.settings.settle_delay);
        } else {
            tracing::info!("No live stream yet, client {} is pending", client_id);
            self.send(client_id, &ServerMessage::StreamStatus { live: false })
                .await;
        }
    }

    pub async fn on_client_disconnected(self: &Arc<Self>, client_id: Uuid) {
        let (producer_id, consumer) = {
            let mut state = self.state.lock().await;
            state.clients.remove(&client_id);

            let producer_id = state
                .producer
                .as_ref()
                .filter(|p| p.peer().client_id() == client_id)
                .map(|p| p.peer().id());

            let consumer = state.consumers.remove(&client_id);
            if let Some(session) = &consumer {
                session.peer().shutdown();
                self.emit(HubEvent::ConsumerClosed {
                    session_id: session.peer().id(),
                    client_id,
                });
            }
            (producer_id, consumer)
        };

        if let Some(session_id) = producer_id {
            tracing::info!("Producer {} disconnected", client_id);
            self.remove_producer(session_id).await;
        }

        if let Some(session) = consumer {
            tracing::info!("Consumer {} disconnected", client_id);
            session.peer().close().await;
        }
    }

    /// Accept a producer offer, replacing any existing producer
    pub async fn on_producer_offer(
        self: &Arc<Self>,
        client_id: Uuid,
        sdp: String,
    ) -> Result<SessionDescription> {
        tracing::info!("Received producer offer from {}", client_id);

        let runtime = match self.runtime() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("Cannot accept producer {}: {}", client_id, e);
                self.send_error(client_id, &e).await;
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = match runtime.create_connection(events_tx).await {
            Ok(pc) => pc,
            Err(e) => {
                tracing::error!("Failed to create producer connection: {}", e);
                self.send_error(client_id, &e).await;
                return Err(e);
            }
        };

        let (session, replaced, stale_consumer, consumers) = {
            let mut state = self.state.lock().await;

            // The old producer is closed before the new one exists
            let replaced = state.producer.take();
            if let Some(old) = &replaced {
                old.peer().shutdown();
                self.emit(HubEvent::ProducerClosed {
                    session_id: old.peer().id(),
                    client_id: old.peer().client_id(),
                });
            }
            if state.current_track.take().is_some() {
                self.emit(HubEvent::TrackCleared);
            }

            let stale_consumer = state.consumers.remove(&client_id);
            if let Some(consumer) = &stale_consumer {
                consumer.peer().shutdown();
                self.emit(HubEvent::ConsumerClosed {
                    session_id: consumer.peer().id(),
                    client_id,
                });
            }

            state
                .clients
                .entry(client_id)
                .and_modify(|entry| entry.role = ClientRole::Producer)
                .or_insert(ClientEntry {
                    role: ClientRole::Producer,
                    admission: Admission::Pending,
                });

            let session_id = state.allocate_session_id();
            let session = Arc::new(ProducerSession::new(session_id, client_id, pc));
            state.producer = Some(session.clone());
            self.emit(HubEvent::ProducerCreated {
                session_id,
                client_id,
            });

            (session, replaced, stale_consumer, state.consumer_clients())
        };

        if let Some(old) = replaced {
            tracing::info!(
                "Producer {} superseded by {}",
                old.peer().client_id(),
                client_id
            );
            old.peer().close().await;
            self.connections
                .send_to_clients(&consumers, &ServerMessage::StreamStatus { live: false })
                .await;
        }
        if let Some(consumer) = stale_consumer {
            consumer.peer().close().await;
        }

        self.spawn_liveness_monitor(&session);

        match session.attach(SessionDescription::offer(sdp)).await {
            Ok(answer) => {
                if session.peer().is_closed() {
                    tracing::debug!("Producer session {} closed during negotiation", session.peer().id());
                    return Err(RelayError::InvalidSignalingState {
                        expected: "stable",
                        actual: SignalingState::Closed,
                    });
                }

                self.send(
                    client_id,
                    &ServerMessage::Answer {
                        sdp: answer.sdp.clone(),
                    },
                )
                .await;
                tracing::info!("Sent answer to producer {}", client_id);

                // Candidates gathered so far were buffered; they follow the answer
                self.spawn_producer_events(&session, events_rx);
                Ok(answer)
            }
            Err(e) => {
                tracing::error!("Producer negotiation with {} failed: {}", client_id, e);
                self.remove_producer(session.peer().id()).await;
                session.peer().close().await;
                self.send_error(client_id, &e).await;
                Err(e)
            }
        }
    }

    /// Apply a consumer's answer. A missing session is tolerated: late and
    /// duplicate answers are expected when clients reconnect.
    pub async fn on_consumer_answer(self: &Arc<Self>, client_id: Uuid, sdp: String) -> Result<()> {
        let Some(session) = self.consumer(client_id).await else {
            tracing::warn!("No consumer session for {}, dropping answer", client_id);
            return Ok(());
        };

        match session.apply_answer(SessionDescription::answer(sdp)).await {
            Ok(Some(offer)) => {
                // The deferred track may have been superseded meanwhile
                let still_current = match session.bound_track().await {
                    Some(track) => {
                        let state = self.state.lock().await;
                        state
                            .current_track
                            .as_ref()
                            .is_some_and(|t| t.id() == track.id())
                    }
                    None => false,
                };
                if !still_current {
                    tracing::info!("Deferred track of consumer {} is gone, resetting session", client_id);
                    self.drop_consumer(client_id, session.peer().id(), true)
                        .await;
                    return Ok(());
                }

                self.send(client_id, &ServerMessage::Offer { sdp: offer.sdp })
                    .await;
                self.watch_offer(&session).await;
                Ok(())
            }
            Ok(None) => {
                tracing::info!("Consumer {} negotiated", client_id);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal_to_session() {
                    tracing::error!("Consumer negotiation with {} failed: {}", client_id, e);
                    self.drop_consumer(client_id, session.peer().id(), false)
                        .await;
                } else {
                    tracing::warn!("Answer from {} rejected: {}", client_id, e);
                }
                self.send_error(client_id, &e).await;
                Err(e)
            }
        }
    }

    pub async fn on_candidate(&self, client_id: Uuid, candidate: IceCandidateData) {
        let target = {
            let state = self.state.lock().await;
            if let Some(producer) = state
                .producer
                .as_ref()
                .filter(|p| p.peer().client_id() == client_id)
            {
                Some(Target::Producer(producer.clone()))
            } else {
                state
                    .consumers
                    .get(&client_id)
                    .map(|c| Target::Consumer(c.clone()))
            }
        };

        let Some(target) = target else {
            tracing::warn!("No session for {}, dropping ICE candidate", client_id);
            return;
        };

        if let Err(e) = target.peer().add_candidate(candidate).await {
            tracing::debug!("Candidate from {} not applied: {}", client_id, e);
        }
    }

    fn runtime(&self) -> Result<Arc<dyn MediaRuntime>> {
        self.runtime.clone().ok_or(RelayError::NoMediaRuntime)
    }

    fn emit(&self, event: HubEvent) {
        tracing::debug!("Hub event: {:?}", event);
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn send(&self, client_id: Uuid, message: &ServerMessage) {
        self.connections.send_to_client(client_id, message).await;
    }

    async fn send_error(&self, client_id: Uuid, error: &RelayError) {
        self.send(
            client_id,
            &ServerMessage::Error {
                message: error.to_string(),
            },
        )
        .await;
    }

    /// Remove the producer if it is still `session_id`, clearing the current
    /// track. Consumers stay up and are told the stream is gone.
    async fn remove_producer(&self, session_id: SessionId) -> bool {
        let removed = {
            let mut state = self.state.lock().await;
            if !state.producer_is(session_id) {
                None
            } else {
                let producer = state.producer.take();
                if let Some(p) = &producer {
                    p.peer().shutdown();
                    self.emit(HubEvent::ProducerClosed {
                        session_id,
                        client_id: p.peer().client_id(),
                    });
                }
                if state.current_track.take().is_some() {
                    self.emit(HubEvent::TrackCleared);
                }
                producer.map(|p| (p, state.consumer_clients()))
            }
        };

        let Some((producer, consumers)) = removed else {
            return false;
        };

        producer.peer().close().await;
        self.connections
            .send_to_clients(&consumers, &ServerMessage::StreamStatus { live: false })
            .await;
        tracing::info!("Producer session {} closed", session_id);
        true
    }

    /// Remove a consumer session if it is still `session_id`; optionally
    /// offer the client the stream again afterwards
    async fn drop_consumer(self: &Arc<Self>, client_id: Uuid, session_id: SessionId, readmit: bool) {
        let removed = {
            let mut state = self.state.lock().await;
            let matches = state
                .consumers
                .get(&client_id)
                .is_some_and(|c| c.peer().id() == session_id);
            if !matches {
                None
            } else {
                let session = state.consumers.remove(&client_id);
                if let Some(s) = &session {
                    s.peer().shutdown();
                    self.emit(HubEvent::ConsumerClosed {
                        session_id,
                        client_id,
                    });
                }
                state.set_admission(client_id, Admission::Pending);
                let readmit = readmit
                    && state.current_track.is_some()
                    && state.admission(client_id).is_some();
                session.map(|s| (s, readmit))
            }
        };

        if let Some((session, readmit)) = removed {
            session.peer().close().await;
            if readmit {
                self.schedule_admission(client_id, self.settings.settle_delay);
            }
        }
    }

    fn schedule_admission(self: &Arc<Self>, client_id: Uuid, delay: Duration) {
        let hub = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            hub.admit_consumer(client_id).await;
        });
    }

    /// Create a consumer session bound to the current live track, if the
    /// client is still waiting and a live track exists
    async fn admit_consumer(self: &Arc<Self>, client_id: Uuid) {
        let (track, producer_id, session_id) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.clients.get(&client_id) else {
                tracing::debug!("Client {} left before admission", client_id);
                return;
            };
            if entry.role != ClientRole::Consumer
                || entry.admission != Admission::Pending
                || state.consumers.contains_key(&client_id)
            {
                return;
            }
            let (Some(track), Some(producer)) = (state.current_track.clone(), &state.producer) else {
                tracing::debug!("No live track, client {} stays pending", client_id);
                return;
            };
            let producer_id = producer.peer().id();
            let session_id = state.allocate_session_id();
            state.set_admission(client_id, Admission::Admitting);
            (track, producer_id, session_id)
        };

        let (session, offer, events_rx) =
            match self.negotiate_consumer(client_id, session_id, &track).await {
                Ok(negotiated) => negotiated,
                Err(e) => {
                    {
                        let mut state = self.state.lock().await;
                        if state.admission(client_id) == Some(Admission::Admitting) {
                            state.set_admission(client_id, Admission::Pending);
                        }
                    }
                    tracing::warn!("Could not admit consumer {}: {}", client_id, e);
                    self.send_error(client_id, &e).await;
                    return;
                }
            };

        let current = {
            let mut state = self.state.lock().await;
            let still_wanted = state.admission(client_id) == Some(Admission::Admitting);
            let current = state
                .current_track
                .clone()
                .filter(|_| still_wanted && state.producer_is(producer_id));

            match &current {
                Some(_) => {
                    state.consumers.insert(client_id, session.clone());
                    state.set_admission(client_id, Admission::Admitted);
                    self.emit(HubEvent::ConsumerCreated {
                        session_id,
                        client_id,
                        track_id: track.id().to_string(),
                    });
                }
                None if still_wanted => state.set_admission(client_id, Admission::Pending),
                None => {}
            }
            current
        };

        let Some(current) = current else {
            tracing::debug!("Admission of {} went stale, discarding session", client_id);
            session.peer().close().await;
            return;
        };

        self.send(client_id, &ServerMessage::Offer { sdp: offer.sdp })
            .await;
        tracing::info!("Sent offer for track {} to consumer {}", track.id(), client_id);

        self.spawn_consumer_events(&session, events_rx);
        self.watch_offer(&session).await;

        // The current track changed while this offer was being made
        if current.id() != track.id() {
            self.rebind_consumer(producer_id, &session, &current).await;
        }
    }

    async fn negotiate_consumer(
        &self,
        client_id: Uuid,
        session_id: SessionId,
        track: &Track,
    ) -> Result<(
        Arc<ConsumerSession>,
        SessionDescription,
        mpsc::UnboundedReceiver<PeerEvent>,
    )> {
        let runtime = self.runtime()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pc = runtime.create_connection(events_tx).await?;
        let session = Arc::new(ConsumerSession::new(session_id, client_id, pc));

        match session.create_offer_with_track(track).await {
            Ok(offer) => Ok((session, offer, events_rx)),
            Err(e) => {
                session.peer().close().await;
                Err(e)
            }
        }
    }

    /// Move `session` onto `track`, as long as `track` is still the current
    /// live track of producer `producer_id`
    async fn rebind_consumer(
        self: &Arc<Self>,
        producer_id: SessionId,
        session: &Arc<ConsumerSession>,
        track: &Track,
    ) {
        let client_id = session.peer().client_id();
        if !self.state.lock().await.serves(producer_id, track) {
            tracing::debug!("Skipping rebind of consumer {} onto stale track {}", client_id, track.id());
            return;
        }

        match session.rebind(track).await {
            Ok(Some(offer)) => {
                if session.peer().is_closed() {
                    return;
                }
                // The producer or its track changed while the offer was made
                if !self.state.lock().await.serves(producer_id, track) {
                    tracing::info!(
                        "Track {} went stale during rebind of consumer {}, resetting session",
                        track.id(),
                        client_id
                    );
                    self.drop_consumer(client_id, session.peer().id(), true)
                        .await;
                    return;
                }
                self.send(client_id, &ServerMessage::Offer { sdp: offer.sdp })
                    .await;
                self.watch_offer(session).await;
                tracing::info!("Renegotiating consumer {} onto track {}", client_id, track.id());
            }
            Ok(None) => {
                tracing::debug!("Rebind of consumer {} deferred or unnecessary", client_id);
            }
            Err(e) => {
                tracing::warn!("Could not rebind consumer {}: {}", client_id, e);
            }
        }
    }

    /// Close the consumer session if the offer just sent stays unanswered
    async fn watch_offer(self: &Arc<Self>, session: &Arc<ConsumerSession>) {
        let timeout = self.settings.negotiation_timeout;
        if timeout.is_zero() {
            return;
        }
        let Some(seq) = session.pending_offer().await else {
            return;
        };

        let hub = Arc::downgrade(self);
        let watched = session.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if watched.pending_offer().await != Some(seq) {
                return;
            }
            let Some(hub) = hub.upgrade() else {
                return;
            };

            let client_id = watched.peer().client_id();
            tracing::warn!("Consumer {} did not answer offer #{} in time", client_id, seq);

            // Closing the session aborts this task, so finish elsewhere
            let session_id = watched.peer().id();
            tokio::spawn(async move {
                hub.drop_consumer(client_id, session_id, false).await;
                hub.send(
                    client_id,
                    &ServerMessage::Error {
                        message: "Negotiation timed out".to_string(),
                    },
                )
                .await;
            });
        });
        session.peer().track_task(handle);
    }

    fn spawn_consumer_events(
        self: &Arc<Self>,
        session: &Arc<ConsumerSession>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let hub = Arc::downgrade(self);
        let session_ref = session.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.on_consumer_event(&session_ref, event).await;
            }
        });
        session.peer().track_task(handle);
    }

    async fn on_consumer_event(self: &Arc<Self>, session: &Arc<ConsumerSession>, event: PeerEvent) {
        let client_id = session.peer().client_id();
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if !session.peer().is_closed() {
                    self.send(client_id, &ServerMessage::IceCandidate { candidate })
                        .await;
                }
            }
            PeerEvent::ConnectivityChanged(state) => {
                session.peer().set_connectivity(state).await;
                match state {
                    ConnectivityState::Connected => {
                        tracing::info!("Consumer {} connected", client_id);
                    }
                    ConnectivityState::Failed => {
                        tracing::warn!("Consumer {} connection failed", client_id);
                        let hub = self.clone();
                        let session_id = session.peer().id();
                        tokio::spawn(async move {
                            hub.drop_consumer(client_id, session_id, true).await;
                        });
                    }
                    _ => {}
                }
            }
            PeerEvent::TrackReceived(track) => {
                tracing::debug!("Ignoring inbound track {} from consumer {}", track.id(), client_id);
            }
        }
    }

    fn spawn_producer_events(
        self: &Arc<Self>,
        session: &Arc<ProducerSession>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let hub = Arc::downgrade(self);
        let session_ref = session.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.on_producer_event(&session_ref, event).await;
            }
        });
        session.peer().track_task(handle);
    }

    async fn on_producer_event(self: &Arc<Self>, session: &Arc<ProducerSession>, event: PeerEvent) {
        let client_id = session.peer().client_id();
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if !session.peer().is_closed() {
                    self.send(client_id, &ServerMessage::IceCandidate { candidate })
                        .await;
                }
            }
            PeerEvent::ConnectivityChanged(state) => {
                session.peer().set_connectivity(state).await;
                match state {
                    ConnectivityState::Connected => {
                        tracing::info!("Producer {} connected", client_id);
                    }
                    ConnectivityState::Failed => {
                        tracing::warn!("Producer {} connection failed", client_id);
                        let hub = self.clone();
                        let session_id = session.peer().id();
                        tokio::spawn(async move {
                            hub.remove_producer(session_id).await;
                        });
                    }
                    _ => {}
                }
            }
            PeerEvent::TrackReceived(track) => {
                session.on_track_received(track.clone()).await;

                // Re-poll as soon as this track changes state
                let producer = Arc::downgrade(session);
                let mut observed = track;
                let handle = tokio::spawn(async move {
                    while let Some(liveness) = observed.next_liveness().await {
                        let Some(producer) = producer.upgrade() else {
                            break;
                        };
                        producer.wake_monitor();
                        if liveness == LivenessState::Ended {
                            break;
                        }
                    }
                });
                session.peer().track_task(handle);
            }
        }
    }

    fn spawn_liveness_monitor(self: &Arc<Self>, session: &Arc<ProducerSession>) {
        let hub = Arc::downgrade(self);
        let producer = Arc::downgrade(session);
        let settings = self.settings.liveness;

        let handle = tokio::spawn(async move {
            let mut monitor = LivenessMonitor::new(settings);
            let mut interval = tokio::time::interval(settings.poll_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let Some(session) = producer.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = session.monitor_woken() => {}
                }

                let tracks = session.received_tracks().await;
                let snapshots: Vec<_> = tracks.iter().map(Track::snapshot).collect();
                let action = monitor.poll(&snapshots);

                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.apply_liveness_action(&session, action, &tracks).await;

                if monitor.is_finished() {
                    tracing::debug!("Liveness monitor for session {} finished", session.peer().id());
                    break;
                }
            }
        });
        session.peer().track_task(handle);
    }

    async fn apply_liveness_action(
        self: &Arc<Self>,
        session: &Arc<ProducerSession>,
        action: MonitorAction,
        tracks: &[Track],
    ) {
        let session_id = session.peer().id();
        match action {
            MonitorAction::None => {}
            MonitorAction::Promote(track_id) => {
                match tracks.iter().find(|t| t.id() == track_id) {
                    Some(track) => self.promote_track(session_id, track).await,
                    None => tracing::warn!("Promoted track {} vanished", track_id),
                }
            }
            MonitorAction::Lost(track_id) => {
                let mut state = self.state.lock().await;
                let is_current = state
                    .current_track
                    .as_ref()
                    .is_some_and(|t| t.id() == track_id);
                if state.producer_is(session_id) && is_current {
                    state.current_track = None;
                    self.emit(HubEvent::TrackCleared);
                    tracing::info!("Track {} ended, searching for a replacement", track_id);
                }
            }
            MonitorAction::NeverLive(track_id) => {
                tracing::warn!("Track {} never went live, ignoring it", track_id);
            }
            MonitorAction::GaveUp => {
                let consumers = {
                    let mut state = self.state.lock().await;
                    if !state.producer_is(session_id) {
                        return;
                    }
                    if state.current_track.take().is_some() {
                        self.emit(HubEvent::TrackCleared);
                    }
                    self.emit(HubEvent::StreamLost);
                    state.consumer_clients()
                };

                tracing::warn!("Stream of session {} ended with no replacement", session_id);
                self.send(
                    session.peer().client_id(),
                    &ServerMessage::Error {
                        message: "Stream ended and no replacement track was found".to_string(),
                    },
                )
                .await;
                self.connections
                    .send_to_clients(&consumers, &ServerMessage::StreamStatus { live: false })
                    .await;
            }
        }
    }

    /// Make `track` the current live track, admit waiting consumers and move
    /// existing consumers onto it
    async fn promote_track(self: &Arc<Self>, session_id: SessionId, track: &Track) {
        let (pending, bound, consumers) = {
            let mut state = self.state.lock().await;
            if !state.producer_is(session_id) {
                tracing::debug!("Ignoring promotion from stale producer session {}", session_id);
                return;
            }
            if !track.is_live() {
                return;
            }
            if state
                .current_track
                .as_ref()
                .is_some_and(|t| t.id() == track.id())
            {
                return;
            }

            state.current_track = Some(track.clone());
            self.emit(HubEvent::TrackPromoted {
                track_id: track.id().to_string(),
            });

            let pending: Vec<Uuid> = state
                .clients
                .iter()
                .filter(|(id, entry)| {
                    entry.role == ClientRole::Consumer
                        && entry.admission == Admission::Pending
                        && !state.consumers.contains_key(*id)
                        && !state.is_producer_client(**id)
                })
                .map(|(id, _)| *id)
                .collect();
            let bound: Vec<_> = state.consumers.values().cloned().collect();
            (pending, bound, state.consumer_clients())
        };

        tracing::info!(
            "Track {} is now live ({} waiting, {} to rebind)",
            track.id(),
            pending.len(),
            bound.len()
        );
        self.connections
            .send_to_clients(&consumers, &ServerMessage::StreamStatus { live: true })
            .await;

        for client_id in pending {
            self.schedule_admission(client_id, Duration::ZERO);
        }
        for session in bound {
            self.rebind_consumer(session_id, &session, track).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::memory::{MemoryPeer, MemoryRuntime};
    use crate::media::{TrackKind, TrackSource};
    use std::future::Future;
    use tokio_test::{assert_err, assert_ok};

    struct Harness {
        hub: Arc<RelayHub>,
        runtime: Arc<MemoryRuntime>,
        connections: Arc<ConnectionManager>,
    }

    struct Client {
        id: Uuid,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl Client {
        async fn next(&mut self) -> ServerMessage {
            let text = tokio::time::timeout(Duration::from_secs(30), self.rx.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("connection closed");
            serde_json::from_str(&text).unwrap()
        }

        /// Skip messages until one matches
        async fn next_matching(&mut self, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
            loop {
                let message = self.next().await;
                if pred(&message) {
                    return message;
                }
            }
        }

        async fn next_offer(&mut self) -> String {
            match self
                .next_matching(|m| matches!(m, ServerMessage::Offer { .. }))
                .await
            {
                ServerMessage::Offer { sdp } => sdp,
                _ => unreachable!(),
            }
        }
    }

    fn test_settings() -> HubSettings {
        HubSettings {
            settle_delay: Duration::from_millis(50),
            negotiation_timeout: Duration::from_secs(60),
            liveness: LivenessSettings {
                poll_interval: Duration::from_millis(100),
                max_search_attempts: 3,
                max_pending_attempts: 5,
            },
        }
    }

    fn harness_with(settings: HubSettings) -> Harness {
        let runtime = Arc::new(MemoryRuntime::new());
        let connections = Arc::new(ConnectionManager::new());
        let hub = RelayHub::new(Some(runtime.clone()), connections.clone(), settings);
        Harness {
            hub,
            runtime,
            connections,
        }
    }

    fn harness() -> Harness {
        harness_with(test_settings())
    }

    fn video(id: &str) -> (TrackSource, Track) {
        Track::channel(id, TrackKind::Video, LivenessState::PendingLive)
    }

    fn candidate(n: u32) -> IceCandidateData {
        IceCandidateData {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..1000 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    impl Harness {
        async fn connect(&self, role: ClientRole) -> Client {
            let id = Uuid::new_v4();
            let (tx, rx) = mpsc::unbounded_channel();
            self.connections.add_connection(id, tx).await;
            self.hub.on_client_connected(id, role).await;
            let mut client = Client { id, rx };
            assert_eq!(client.next().await, ServerMessage::StartWebrtc);
            client
        }

        async fn start_producer(&self) -> (Client, Arc<MemoryPeer>) {
            let mut producer = self.connect(ClientRole::Producer).await;
            assert_ok!(
                self.hub
                    .on_producer_offer(producer.id, "v=0 producer".to_string())
                    .await
            );
            assert!(matches!(producer.next().await, ServerMessage::Answer { .. }));
            let peer = self.runtime.last_connection().await.unwrap();
            (producer, peer)
        }

        /// Producer with one live video track
        async fn live_producer(&self, track_id: &str) -> (Client, Arc<MemoryPeer>, TrackSource) {
            let (producer, peer) = self.start_producer().await;
            let (source, track) = video(track_id);
            peer.receive_track(track).await;
            source.mark_live();
            self.wait_for_current(track_id).await;
            (producer, peer, source)
        }

        async fn wait_for_current(&self, track_id: &str) {
            eventually(|| async move {
                self.hub
                    .current_track()
                    .await
                    .is_some_and(|t| t.id() == track_id)
            })
            .await;
        }

        async fn peer_for_offer(&self, sdp: &str) -> Arc<MemoryPeer> {
            let id: u64 = sdp
                .split_whitespace()
                .find_map(|part| part.strip_prefix("peer="))
                .and_then(|id| id.parse().ok())
                .expect("offer without peer id");
            self.runtime
                .connections()
                .await
                .into_iter()
                .find(|p| p.id() == id)
                .unwrap()
        }

        /// Connect a consumer and complete its first negotiation
        async fn admitted_consumer(&self) -> (Client, Arc<MemoryPeer>) {
            let mut consumer = self.connect(ClientRole::Consumer).await;
            let offer = consumer.next_offer().await;
            let peer = self.peer_for_offer(&offer).await;
            assert_ok!(
                self.hub
                    .on_consumer_answer(consumer.id, "v=0 consumer".to_string())
                    .await
            );
            (consumer, peer)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn producer_offer_without_media_runtime_is_reported() {
        let connections = Arc::new(ConnectionManager::new());
        let hub = RelayHub::new(None, connections.clone(), test_settings());
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        connections.add_connection(id, tx).await;

        hub.on_client_connected(id, ClientRole::Producer).await;
        let err = assert_err!(hub.on_producer_offer(id, "v=0".to_string()).await);

        assert!(matches!(err, RelayError::NoMediaRuntime));
        assert!(hub.producer().await.is_none());
        let _start = rx.recv().await.unwrap();
        let error: ServerMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(error, ServerMessage::Error { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_waits_until_a_track_goes_live() {
        let h = harness();
        let (_producer, producer_peer) = h.start_producer().await;

        let mut consumer = h.connect(ClientRole::Consumer).await;
        assert_eq!(consumer.next().await, ServerMessage::StreamStatus { live: false });
        assert!(h.hub.is_pending(consumer.id).await);

        let (source, track) = video("t1");
        producer_peer.receive_track(track).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h.hub.current_track().await.is_none());
        assert!(h.hub.is_pending(consumer.id).await);

        source.mark_live();
        assert_eq!(consumer.next().await, ServerMessage::StreamStatus { live: true });
        let offer = consumer.next_offer().await;

        let consumer_peer = h.peer_for_offer(&offer).await;
        assert_eq!(consumer_peer.bound_tracks().await, vec!["t1"]);
        let session = h.hub.consumer(consumer.id).await.unwrap();
        assert_eq!(session.bound_track().await.unwrap().id(), "t1");
    }

    #[tokio::test(start_paused = true)]
    async fn two_consumers_reach_connected() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;

        let (a, a_peer) = h.admitted_consumer().await;
        let (b, b_peer) = h.admitted_consumer().await;
        a_peer.set_connectivity(ConnectivityState::Connected);
        b_peer.set_connectivity(ConnectivityState::Connected);

        let hub = &h.hub;
        for client in [a.id, b.id] {
            eventually(|| async move {
                match hub.consumer(client).await {
                    Some(s) => s.peer().connectivity_state().await == ConnectivityState::Connected,
                    None => false,
                }
            })
            .await;
        }

        let status = h.hub.status().await;
        assert_eq!(status.consumers, 2);
        assert_eq!(status.pending_clients, 0);
        assert_eq!(status.current_track_id.as_deref(), Some("t1"));
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_track_reaches_new_and_existing_consumers() {
        let h = harness();
        let (_producer, producer_peer, t1) = h.live_producer("t1").await;
        let (mut first, first_peer) = h.admitted_consumer().await;

        t1.mark_ended();
        let (t2, track) = video("t2");
        producer_peer.receive_track(track).await;
        t2.mark_live();
        h.wait_for_current("t2").await;

        // The existing consumer is renegotiated onto the replacement
        first.next_offer().await;
        assert_eq!(first_peer.bound_tracks().await, vec!["t1", "t2"]);

        let mut third = h.connect(ClientRole::Consumer).await;
        let offer = third.next_offer().await;
        let third_peer = h.peer_for_offer(&offer).await;
        assert_eq!(third_peer.bound_tracks().await, vec!["t2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_loss_without_replacement_gives_up() {
        let h = harness();
        let mut events = h.hub.subscribe();
        let (mut producer, _peer, source) = h.live_producer("t1").await;

        source.mark_ended();
        let message = producer
            .next_matching(|m| matches!(m, ServerMessage::Error { .. }))
            .await;
        assert_eq!(
            message,
            ServerMessage::Error {
                message: "Stream ended and no replacement track was found".to_string()
            }
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&HubEvent::StreamLost));

        let mut late = h.connect(ClientRole::Consumer).await;
        assert_eq!(late.next().await, ServerMessage::StreamStatus { live: false });
        assert!(h.hub.is_pending(late.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn track_ending_before_admission_leaves_no_session() {
        let h = harness();
        let (_producer, _peer, source) = h.live_producer("t1").await;

        let consumer = h.connect(ClientRole::Consumer).await;
        source.mark_ended();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(h.hub.consumer(consumer.id).await.is_none());
        assert!(h.hub.is_pending(consumer.id).await);
        assert_eq!(h.hub.status().await.consumers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_producer_closes_old_one_first() {
        let h = harness();
        let mut events = h.hub.subscribe();

        let (first, first_peer) = h.start_producer().await;
        let (second, second_peer) = h.start_producer().await;

        assert!(first_peer.is_closed());
        assert!(!second_peer.is_closed());
        assert_eq!(
            h.hub.producer().await.unwrap().peer().client_id(),
            second.id
        );

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                HubEvent::ProducerCreated { .. } | HubEvent::ProducerClosed { .. }
            ) {
                seen.push(event);
            }
        }
        assert_eq!(
            seen,
            vec![
                HubEvent::ProducerCreated {
                    session_id: 1,
                    client_id: first.id
                },
                HubEvent::ProducerClosed {
                    session_id: 1,
                    client_id: first.id
                },
                HubEvent::ProducerCreated {
                    session_id: 2,
                    client_id: second.id
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn producer_disconnect_keeps_consumers() {
        let h = harness();
        let (producer, producer_peer, _source) = h.live_producer("t1").await;
        let (mut consumer, consumer_peer) = h.admitted_consumer().await;

        h.hub.on_client_disconnected(producer.id).await;

        assert!(producer_peer.is_closed());
        assert!(h.hub.current_track().await.is_none());
        assert_eq!(
            consumer
                .next_matching(|m| matches!(m, ServerMessage::StreamStatus { .. }))
                .await,
            ServerMessage::StreamStatus { live: false }
        );
        let session = h.hub.consumer(consumer.id).await.unwrap();
        assert!(!session.peer().is_closed());
        assert!(!consumer_peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_before_answer_are_applied_in_order() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let mut consumer = h.connect(ClientRole::Consumer).await;
        let offer = consumer.next_offer().await;
        let peer = h.peer_for_offer(&offer).await;

        for n in 1..=3 {
            h.hub.on_candidate(consumer.id, candidate(n)).await;
        }
        assert!(peer.applied_candidates().await.is_empty());

        assert_ok!(
            h.hub
                .on_consumer_answer(consumer.id, "v=0 consumer".to_string())
                .await
        );
        h.hub.on_candidate(consumer.id, candidate(4)).await;

        assert_eq!(
            peer.applied_candidates().await,
            vec!["candidate:1", "candidate:2", "candidate:3", "candidate:4"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn local_candidates_follow_the_offer() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let mut consumer = h.connect(ClientRole::Consumer).await;
        let offer = consumer.next_offer().await;
        let peer = h.peer_for_offer(&offer).await;

        peer.gather_candidate(candidate(7));

        assert_eq!(
            consumer.next().await,
            ServerMessage::IceCandidate {
                candidate: candidate(7)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answer_without_session_is_ignored() {
        let h = harness();
        let stranger = Uuid::new_v4();
        assert_ok!(h.hub.on_consumer_answer(stranger, "v=0".to_string()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_answer_is_rejected() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let (mut consumer, _peer) = h.admitted_consumer().await;

        let err = assert_err!(
            h.hub
                .on_consumer_answer(consumer.id, "v=0 again".to_string())
                .await
        );
        assert!(matches!(err, RelayError::InvalidSignalingState { .. }));
        assert!(matches!(
            consumer
                .next_matching(|m| matches!(m, ServerMessage::Error { .. }))
                .await,
            ServerMessage::Error { .. }
        ));
        // The session survives a rejected answer
        assert!(h.hub.consumer(consumer.id).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_times_out() {
        let h = harness_with(HubSettings {
            negotiation_timeout: Duration::from_secs(1),
            ..test_settings()
        });
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let mut consumer = h.connect(ClientRole::Consumer).await;
        let offer = consumer.next_offer().await;
        let peer = h.peer_for_offer(&offer).await;

        assert_eq!(
            consumer
                .next_matching(|m| matches!(m, ServerMessage::Error { .. }))
                .await,
            ServerMessage::Error {
                message: "Negotiation timed out".to_string()
            }
        );
        eventually(|| {
            let closed = peer.is_closed();
            async move { closed }
        })
        .await;
        assert!(h.hub.consumer(consumer.id).await.is_none());
        assert!(h.hub.is_pending(consumer.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_consumer_is_offered_the_stream_again() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let (mut consumer, first_peer) = h.admitted_consumer().await;

        first_peer.set_connectivity(ConnectivityState::Failed);

        let offer = consumer.next_offer().await;
        let second_peer = h.peer_for_offer(&offer).await;
        assert!(first_peer.is_closed());
        assert_ne!(first_peer.id(), second_peer.id());
        assert_eq!(second_peer.bound_tracks().await, vec!["t1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_reject_drops_the_client() {
        let h = harness();
        let (_producer, _peer, _source) = h.live_producer("t1").await;
        let (consumer, consumer_peer) = h.admitted_consumer().await;

        let outcome = h
            .hub
            .dispatch(consumer.id, ClientMessage::ConnectionReject)
            .await;

        assert_eq!(outcome, Dispatch::Disconnect);
        assert!(consumer_peer.is_closed());
        assert!(h.hub.consumer(consumer.id).await.is_none());
        assert!(!h.hub.is_pending(consumer.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_track_that_never_goes_live_is_not_promoted() {
        let h = harness();
        let (_producer, producer_peer) = h.start_producer().await;
        let (_stuck, track) = video("stuck");
        producer_peer.receive_track(track).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.hub.current_track().await.is_none());

        let (live, track) = video("t2");
        producer_peer.receive_track(track).await;
        live.mark_live();
        h.wait_for_current("t2").await;
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_racing_a_new_producer_leaves_no_stale_binding() {
        let h = harness();
        let (_first, _first_peer, _t1) = h.live_producer("t1").await;
        let (a, a_peer) = h.admitted_consumer().await;
        let (b, b_peer) = h.admitted_consumer().await;
        let old = h.hub.producer().await.unwrap();

        let (t2_source, t2) = video("t2");
        t2_source.mark_live();
        let second = h.connect(ClientRole::Producer).await;

        let (_, answered) = tokio::join!(
            h.hub.promote_track(old.peer().id(), &t2),
            h.hub.on_producer_offer(second.id, "v=0 second".to_string()),
        );
        assert_ok!(answered);

        assert!(old.peer().is_closed());
        assert_eq!(
            h.hub.producer().await.unwrap().peer().client_id(),
            second.id
        );
        assert!(h.hub.current_track().await.is_none());

        // No open consumer may carry the closed producer's replacement track
        for peer in [&a_peer, &b_peer] {
            let on_t2 = peer.bound_tracks().await.contains(&"t2".to_string());
            assert!(!on_t2 || peer.is_closed(), "peer {} left on t2", peer.id());
        }
        for client in [a.id, b.id] {
            if let Some(session) = h.hub.consumer(client).await {
                assert_eq!(session.bound_track().await.unwrap().id(), "t1");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_producer_negotiation_keeps_consumers() {
        let h = harness();
        let (producer, _first_peer, _source) = h.live_producer("t1").await;
        let (mut consumer, consumer_peer) = h.admitted_consumer().await;

        h.runtime.fail_negotiation();
        let err = assert_err!(
            h.hub
                .on_producer_offer(producer.id, "v=0 again".to_string())
                .await
        );

        assert!(matches!(err, RelayError::Negotiation(_)));
        assert!(h.hub.producer().await.is_none());
        assert!(h.hub.current_track().await.is_none());
        assert_eq!(
            consumer
                .next_matching(|m| matches!(m, ServerMessage::StreamStatus { .. }))
                .await,
            ServerMessage::StreamStatus { live: false }
        );
        let session = h.hub.consumer(consumer.id).await.unwrap();
        assert!(!session.peer().is_closed());
        assert!(!consumer_peer.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn producer_connection_failure_keeps_consumers() {
        let h = harness();
        let mut events = h.hub.subscribe();
        let (_producer, producer_peer, _source) = h.live_producer("t1").await;
        let (mut consumer, consumer_peer) = h.admitted_consumer().await;

        producer_peer.set_connectivity(ConnectivityState::Failed);

        let hub = &h.hub;
        eventually(|| async move { hub.producer().await.is_none() }).await;
        assert!(producer_peer.is_closed());
        assert!(h.hub.current_track().await.is_none());
        assert_eq!(
            consumer
                .next_matching(|m| matches!(m, ServerMessage::StreamStatus { .. }))
                .await,
            ServerMessage::StreamStatus { live: false }
        );
        let session = h.hub.consumer(consumer.id).await.unwrap();
        assert!(!session.peer().is_closed());
        assert!(!consumer_peer.is_closed());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().any(|e| matches!(e, HubEvent::ProducerClosed { .. })));
        assert!(!seen.iter().any(|e| matches!(e, HubEvent::ConsumerClosed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_rebind_is_dropped_once_its_producer_is_gone() {
        let h = harness();
        let (producer, _producer_peer, _t1) = h.live_producer("t1").await;
        let mut consumer = h.connect(ClientRole::Consumer).await;
        let offer = consumer.next_offer().await;
        let peer = h.peer_for_offer(&offer).await;

        // Promoted while the first offer is still unanswered
        let producer_id = h.hub.producer().await.unwrap().peer().id();
        let (t2_source, t2) = video("t2");
        t2_source.mark_live();
        h.hub.promote_track(producer_id, &t2).await;
        h.hub.on_client_disconnected(producer.id).await;

        assert_ok!(
            h.hub
                .on_consumer_answer(consumer.id, "v=0 consumer".to_string())
                .await
        );

        assert!(peer.is_closed());
        assert!(h.hub.consumer(consumer.id).await.is_none());
        assert!(h.hub.is_pending(consumer.id).await);
    }
}
