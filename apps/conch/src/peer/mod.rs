//! Peer-connection capability consumed by the negotiator.
//!
//! Backends report events through a [`PeerConnectionObserver`]; the negotiator
//! registers an [`EventForwarder`] that turns them into [`PeerEvent`]s on the
//! call task's queue, tagged with the connection's generation.

pub mod webrtc;

use crate::media::{MediaStreamHandle, MediaTrack};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use conch_proto::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerError {
    #[error("peer connection backend error: {0}")]
    Backend(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.credential = Some(credential.into());
        self
    }
}

/// Directions to ask for in an offer even when nothing is sent that way.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OfferOptions {
    pub receive_audio: bool,
    pub receive_video: bool,
}

impl Default for OfferOptions {
    fn default() -> Self {
        Self {
            receive_audio: true,
            receive_video: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// States after which the call cannot continue on this connection.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

pub trait PeerConnectionObserver: Send + Sync {
    /// `None` marks the end of candidate gathering.
    fn on_ice_candidate(&self, candidate: Option<IceCandidate>);
    fn on_ice_connection_state_change(&self, state: IceConnectionState);
    fn on_signaling_state_change(&self, state: SignalingState);
    fn on_track(&self, stream: MediaStreamHandle);
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
        stream: &MediaStreamHandle,
    ) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn stop_transceivers(&self);
    async fn close(&self) -> Result<(), PeerError>;

    fn register_observer(&self, observer: Arc<dyn PeerConnectionObserver>);
    /// Detaches every event hook; no observer call happens afterwards.
    fn clear_observer(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    IceCandidate(Option<IceCandidate>),
    IceConnectionState(IceConnectionState),
    SignalingState(SignalingState),
    Track(MediaStreamHandle),
}

pub struct EventForwarder {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventForwarder {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    fn forward(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(
                target = "conch::peer",
                generation = self.generation,
                "peer event dropped; call task gone"
            );
        }
    }
}

impl PeerConnectionObserver for EventForwarder {
    fn on_ice_candidate(&self, candidate: Option<IceCandidate>) {
        self.forward(PeerEventKind::IceCandidate(candidate));
    }

    fn on_ice_connection_state_change(&self, state: IceConnectionState) {
        self.forward(PeerEventKind::IceConnectionState(state));
    }

    fn on_signaling_state_change(&self, state: SignalingState) {
        self.forward(PeerEventKind::SignalingState(state));
    }

    fn on_track(&self, stream: MediaStreamHandle) {
        self.forward(PeerEventKind::Track(stream));
    }
}
