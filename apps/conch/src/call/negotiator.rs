use super::error::{CallError, FailureReason, NegotiationStep, StepResultExt};
use super::{CallSetup, NoticeSink};
use crate::media::{MediaSession, RenderSink};
use crate::peer::{
    EventForwarder, IceCandidate, IceServer, OfferOptions, PeerConnection, PeerConnectionFactory,
    PeerEvent, PeerEventKind, SessionDescription, SignalingState,
};
use crate::signaling::{SignalSink, SignalingMessage};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Negotiating,
    Active,
    Closing,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Negotiating => "negotiating",
            CallState::Active => "active",
            CallState::Closing => "closing",
        }
    }
}

struct ActivePeer {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    remote_description_set: bool,
    local_description_sent: bool,
    tracks_attached: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: Vec<IceCandidate>,
}

impl ActivePeer {
    fn new(generation: u64, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            generation,
            connection,
            remote_description_set: false,
            local_description_sent: false,
            tracks_attached: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
        }
    }
}

/// Offer/answer state machine for one side of a call.
///
/// Owns at most one peer connection. Every method runs to completion before
/// the next input is looked at; the call task guarantees that ordering.
pub struct Negotiator {
    signaling: Arc<dyn SignalSink>,
    factory: Arc<dyn PeerConnectionFactory>,
    media: MediaSession,
    remote_view: Arc<dyn RenderSink>,
    notices: Arc<dyn NoticeSink>,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<PeerEvent>,
    next_generation: u64,
    peer: Option<ActivePeer>,
    state: watch::Sender<CallState>,
}

impl Negotiator {
    pub fn new(setup: CallSetup, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        let media = MediaSession::new(setup.capture, setup.constraints, setup.local_view);
        let (state, _) = watch::channel(CallState::Idle);
        Self {
            signaling: setup.signaling,
            factory: setup.factory,
            media,
            remote_view: setup.remote_view,
            notices: setup.notices,
            ice_servers: setup.ice_servers,
            events,
            next_generation: 0,
            peer: None,
            state,
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    pub fn has_peer(&self) -> bool {
        self.peer.is_some()
    }

    fn set_state(&self, next: CallState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                target = "conch::call",
                from = previous.as_str(),
                to = next.as_str(),
                "call state"
            );
        }
    }

    pub async fn acquire_media(&mut self) {
        if let Err(err) = self.media.acquire().await {
            self.fail(err.into()).await;
        }
    }

    pub fn pause_preview(&mut self) {
        self.media.pause();
    }

    pub fn resume_preview(&mut self) {
        self.media.resume();
    }

    pub async fn start_call(&mut self) {
        let state = self.state();
        if state != CallState::Idle {
            tracing::debug!(
                target = "conch::call",
                state = state.as_str(),
                "start_call ignored; call already in progress"
            );
            return;
        }
        if let Err(err) = self.send_offer().await {
            self.fail(err).await;
        }
    }

    async fn send_offer(&mut self) -> Result<(), CallError> {
        let connection = self.ensure_peer().await?;
        self.set_state(CallState::Negotiating);
        self.attach_local_tracks().await?;
        let offer = connection
            .create_offer(OfferOptions::default())
            .await
            .at(NegotiationStep::CreateOffer)?;
        connection
            .set_local_description(offer.clone())
            .await
            .at(NegotiationStep::SetLocalDescription)?;
        self.signaling.send_message(SignalingMessage::Offer(offer));
        tracing::info!(target = "conch::call", "offer sent");
        self.local_description_sent();
        Ok(())
    }

    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Offer(desc) => self.handle_offer(desc).await,
            SignalingMessage::Answer(desc) => self.handle_answer(desc).await,
            SignalingMessage::IceCandidate(candidate) => {
                self.handle_remote_candidate(candidate).await
            }
            SignalingMessage::Hangup => {
                tracing::info!(target = "conch::call", "remote hung up");
                self.teardown("remote hangup").await;
            }
        }
    }

    async fn handle_offer(&mut self, desc: SessionDescription) {
        if self.state() == CallState::Closing {
            tracing::debug!(target = "conch::call", "offer ignored while closing");
            return;
        }
        if let Err(err) = self.send_answer(desc).await {
            self.fail(err).await;
        }
    }

    async fn send_answer(&mut self, offer: SessionDescription) -> Result<(), CallError> {
        let connection = self.ensure_peer().await?;
        self.set_state(CallState::Negotiating);
        if self.media.stream().is_none() {
            self.media.acquire().await?;
            self.media.resume();
        }
        connection
            .set_remote_description(offer)
            .await
            .at(NegotiationStep::SetRemoteDescription)?;
        self.remote_description_set().await;
        self.media.show_preview();
        self.attach_local_tracks().await?;
        let answer = connection
            .create_answer()
            .await
            .at(NegotiationStep::CreateAnswer)?;
        connection
            .set_local_description(answer.clone())
            .await
            .at(NegotiationStep::SetLocalDescription)?;
        let answer = connection.local_description().await.unwrap_or(answer);
        self.signaling.send_message(SignalingMessage::Answer(answer));
        tracing::info!(target = "conch::call", "answer sent");
        self.set_state(CallState::Active);
        self.local_description_sent();
        Ok(())
    }

    async fn handle_answer(&mut self, desc: SessionDescription) {
        let state = self.state();
        let connection = match (&self.peer, state) {
            (Some(peer), CallState::Negotiating) => Arc::clone(&peer.connection),
            _ => {
                tracing::debug!(
                    target = "conch::call",
                    state = state.as_str(),
                    "answer ignored; no offer outstanding"
                );
                return;
            }
        };
        let applied = connection
            .set_remote_description(desc)
            .await
            .at(NegotiationStep::SetRemoteDescription);
        match applied {
            Ok(()) => {
                tracing::info!(target = "conch::call", "answer applied");
                self.set_state(CallState::Active);
                self.remote_description_set().await;
            }
            Err(err) => self.fail(err.into()).await,
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(peer) = self.peer.as_mut() else {
            tracing::debug!(
                target = "conch::call",
                "remote candidate without a peer connection; dropping"
            );
            return;
        };
        if !peer.remote_description_set {
            tracing::debug!(
                target = "conch::call",
                buffered = peer.pending_remote.len() + 1,
                "remote candidate before remote description; buffering"
            );
            peer.pending_remote.push(candidate);
            return;
        }
        let connection = Arc::clone(&peer.connection);
        apply_candidate(connection.as_ref(), candidate).await;
    }

    /// Sends a hangup whether or not a call exists, then tears down.
    /// Relay frames were dropped before they reached us. Mid-negotiation that
    /// may have been the offer or answer, so the attempt is abandoned and the
    /// other side told to start over.
    pub async fn signals_lost(&mut self, skipped: u64) {
        if self.state() != CallState::Negotiating {
            return;
        }
        tracing::warn!(
            target = "conch::call",
            skipped,
            "signaling messages lost during negotiation; abandoning call"
        );
        self.hang_up().await;
    }

    pub async fn hang_up(&mut self) {
        self.signaling.send_message(SignalingMessage::Hangup);
        self.teardown("local hangup").await;
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(peer) = self.peer.as_mut() else {
            tracing::trace!(target = "conch::call", "peer event without a connection");
            return;
        };
        if event.generation != peer.generation {
            tracing::trace!(
                target = "conch::call",
                stale = event.generation,
                current = peer.generation,
                "stale peer event ignored"
            );
            return;
        }
        match event.kind {
            PeerEventKind::IceCandidate(None) => {
                tracing::debug!(target = "conch::call", "local candidate gathering complete");
            }
            PeerEventKind::IceCandidate(Some(candidate)) => {
                if peer.local_description_sent {
                    self.signaling
                        .send_message(SignalingMessage::IceCandidate(candidate));
                } else {
                    peer.pending_local.push(candidate);
                }
            }
            PeerEventKind::IceConnectionState(state) => {
                tracing::debug!(target = "conch::call", ?state, "ice connection state");
                if state.is_fatal() {
                    self.teardown("ice connection lost").await;
                }
            }
            PeerEventKind::SignalingState(state) => {
                if state == SignalingState::Closed {
                    self.teardown("signaling state closed").await;
                }
            }
            PeerEventKind::Track(stream) => {
                tracing::info!(
                    target = "conch::call",
                    stream = stream.id(),
                    "remote stream attached"
                );
                self.remote_view.attach(Some(stream));
                if self.state() == CallState::Negotiating {
                    self.set_state(CallState::Active);
                }
            }
        }
    }

    /// Closes the connection without telling the other side, then releases
    /// the local capture.
    pub async fn shutdown(&mut self) {
        self.teardown("shutdown").await;
        self.media.release();
    }

    async fn ensure_peer(&mut self) -> Result<Arc<dyn PeerConnection>, CallError> {
        if let Some(peer) = &self.peer {
            return Ok(Arc::clone(&peer.connection));
        }
        let connection = self
            .factory
            .create(&self.ice_servers)
            .await
            .at(NegotiationStep::CreateConnection)?;
        self.next_generation += 1;
        let generation = self.next_generation;
        connection.register_observer(Arc::new(EventForwarder::new(
            generation,
            self.events.clone(),
        )));
        self.peer = Some(ActivePeer::new(generation, Arc::clone(&connection)));
        tracing::info!(target = "conch::call", generation, "peer connection created");
        Ok(connection)
    }

    async fn attach_local_tracks(&mut self) -> Result<(), CallError> {
        let Some(stream) = self.media.stream().cloned() else {
            return Ok(());
        };
        let Some(peer) = self.peer.as_mut() else {
            return Ok(());
        };
        if peer.tracks_attached {
            return Ok(());
        }
        for track in stream.tracks() {
            peer.connection
                .add_track(Arc::clone(track), &stream)
                .await
                .at(NegotiationStep::AttachTracks)?;
        }
        peer.tracks_attached = true;
        Ok(())
    }

    async fn remote_description_set(&mut self) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        peer.remote_description_set = true;
        let pending = std::mem::take(&mut peer.pending_remote);
        let connection = Arc::clone(&peer.connection);
        for candidate in pending {
            apply_candidate(connection.as_ref(), candidate).await;
        }
    }

    fn local_description_sent(&mut self) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        peer.local_description_sent = true;
        for candidate in peer.pending_local.drain(..) {
            self.signaling
                .send_message(SignalingMessage::IceCandidate(candidate));
        }
    }

    async fn fail(&mut self, err: CallError) {
        match err.reason() {
            FailureReason::PermissionDenied | FailureReason::SecurityRestricted => {
                tracing::info!(target = "conch::call", "call aborted: {err}");
            }
            FailureReason::NotFound => {
                tracing::warn!(target = "conch::call", "call aborted: {err}");
            }
            FailureReason::Other => {
                tracing::error!(target = "conch::call", "peer connection setup failed: {err}");
            }
        }
        if let Some(notice) = err.notice() {
            self.notices.notify(&notice);
        }
        self.teardown("call failed").await;
    }

    async fn teardown(&mut self, reason: &'static str) {
        let Some(peer) = self.peer.take() else {
            self.set_state(CallState::Idle);
            return;
        };
        self.set_state(CallState::Closing);
        peer.connection.clear_observer();
        peer.connection.stop_transceivers().await;
        if let Err(err) = peer.connection.close().await {
            tracing::debug!(target = "conch::call", "peer close failed: {err}");
        }
        self.remote_view.attach(None);
        self.set_state(CallState::Idle);
        tracing::info!(
            target = "conch::call",
            generation = peer.generation,
            reason,
            "peer connection torn down"
        );
    }
}

async fn apply_candidate(connection: &dyn PeerConnection, candidate: IceCandidate) {
    if let Err(err) = connection.add_ice_candidate(candidate).await {
        tracing::warn!(
            target = "conch::call",
            "failed to apply remote candidate: {err}"
        );
    }
}
