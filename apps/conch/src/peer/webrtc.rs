//! [`PeerConnection`] backed by webrtc-rs.

use super::{
    IceCandidate, IceConnectionState, IceServer, OfferOptions, PeerConnection,
    PeerConnectionFactory, PeerConnectionObserver, PeerError, SdpType, SessionDescription,
    SignalingState,
};
use crate::media::{MediaStreamHandle, MediaTrack, TrackKind};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

impl From<webrtc::Error> for PeerError {
    fn from(err: webrtc::Error) -> Self {
        PeerError::Backend(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WebRtcPeerFactory;

impl WebRtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = WebRtcPeer::new(ice_servers).await?;
        Ok(Arc::new(peer))
    }
}

type ObserverSlot = Arc<RwLock<Option<Arc<dyn PeerConnectionObserver>>>>;

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    observer: ObserverSlot,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    remote_tracks: Arc<Mutex<HashMap<String, Vec<Arc<MediaTrack>>>>>,
}

impl WebRtcPeer {
    pub async fn new(ice_servers: &[IceServer]) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);
        tracing::debug!(
            target = "conch::peer",
            ice_servers = ice_servers.len(),
            "peer connection created"
        );

        let peer = Self {
            pc,
            observer: Arc::new(RwLock::new(None)),
            local_tracks: Mutex::new(HashMap::new()),
            remote_tracks: Arc::new(Mutex::new(HashMap::new())),
        };
        peer.install_handlers();
        Ok(peer)
    }

    /// Sample writer for a local track previously handed to [`PeerConnection::add_track`].
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    fn install_handlers(&self) {
        let slot = Arc::clone(&self.observer);
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    let candidate = match candidate.map(|c| c.to_json()).transpose() {
                        Ok(candidate) => candidate.map(ice_candidate_from_init),
                        Err(err) => {
                            tracing::warn!(
                                target = "conch::peer",
                                "failed to serialise local candidate: {err}"
                            );
                            return;
                        }
                    };
                    if let Some(observer) = current(&slot) {
                        observer.on_ice_candidate(candidate);
                    }
                })
            }));

        let slot = Arc::clone(&self.observer);
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    tracing::debug!(target = "conch::peer", ?state, "ice connection state");
                    let Some(state) = ice_state(state) else {
                        return;
                    };
                    if let Some(observer) = current(&slot) {
                        observer.on_ice_connection_state_change(state);
                    }
                })
            }));

        let slot = Arc::clone(&self.observer);
        self.pc
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let slot = Arc::clone(&slot);
                Box::pin(async move {
                    tracing::debug!(target = "conch::peer", ?state, "signaling state");
                    let Some(state) = signaling_state(state) else {
                        return;
                    };
                    if let Some(observer) = current(&slot) {
                        observer.on_signaling_state_change(state);
                    }
                })
            }));

        let slot = Arc::clone(&self.observer);
        let remote_tracks = Arc::clone(&self.remote_tracks);
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let slot = Arc::clone(&slot);
                let remote_tracks = Arc::clone(&remote_tracks);
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let stream_id = track.stream_id();
                    let stream = {
                        let mut remote = remote_tracks.lock();
                        let tracks = remote.entry(stream_id.clone()).or_default();
                        tracks.push(Arc::new(MediaTrack::with_id(track.id(), kind)));
                        MediaStreamHandle::from_shared(stream_id, tracks.clone())
                    };
                    tracing::info!(
                        target = "conch::peer",
                        stream = stream.id(),
                        kind = kind.as_str(),
                        "remote track received"
                    );
                    // Keep the receive pipeline moving; nothing decodes here yet.
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                    if let Some(observer) = current(&slot) {
                        observer.on_track(stream);
                    }
                })
            },
        ));
    }

    async fn ensure_receivers(&self, options: OfferOptions) -> Result<(), PeerError> {
        let transceivers = self.pc.get_transceivers().await;
        let wanted = [
            (options.receive_audio, RTPCodecType::Audio),
            (options.receive_video, RTPCodecType::Video),
        ];
        for (wanted, kind) in wanted {
            if !wanted || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

fn current(slot: &ObserverSlot) -> Option<Arc<dyn PeerConnectionObserver>> {
    slot.read().clone()
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn create_offer(&self, options: OfferOptions) -> Result<SessionDescription, PeerError> {
        self.ensure_receivers(options).await?;
        let offer = self.pc.create_offer(None).await?;
        session_description(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        session_description(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(rtc_description(desc)?).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        session_description(&desc).ok()
    }

    async fn add_track(
        &self,
        track: Arc<MediaTrack>,
        stream: &MediaStreamHandle,
    ) -> Result<(), PeerError> {
        let capability = match track.kind() {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            track.id().to_owned(),
            stream.id().to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be read for the interceptors to make progress.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        self.local_tracks.lock().insert(track.id().to_owned(), local);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn stop_transceivers(&self) {
        for transceiver in self.pc.get_transceivers().await {
            if let Err(err) = transceiver.stop().await {
                tracing::debug!(target = "conch::peer", "transceiver stop failed: {err}");
            }
        }
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        self.local_tracks.lock().clear();
        self.remote_tracks.lock().clear();
        Ok(())
    }

    fn register_observer(&self, observer: Arc<dyn PeerConnectionObserver>) {
        *self.observer.write() = Some(observer);
    }

    fn clear_observer(&self) {
        self.observer.write().take();
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_signaling_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(PeerError::InvalidDescription(
                "rollback descriptions are not supported".into(),
            ));
        }
    };
    parsed.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn session_description(desc: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => {
            return Err(PeerError::InvalidDescription(
                "backend returned a description without a type".into(),
            ));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

fn ice_candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    Some(match state {
        RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaTrack;

    #[test_timeout::tokio_timeout_test]
    async fn offer_requests_both_directions_without_tracks() {
        let peer = WebRtcPeer::new(&[]).await.expect("peer");
        let offer = peer
            .create_offer(OfferOptions::default())
            .await
            .expect("offer");
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        peer.close().await.expect("close");
    }

    #[test_timeout::tokio_timeout_test]
    async fn local_tracks_become_senders() {
        let peer = WebRtcPeer::new(&[]).await.expect("peer");
        let stream = MediaStreamHandle::new(
            "local",
            vec![
                MediaTrack::with_id("mic", TrackKind::Audio),
                MediaTrack::with_id("cam", TrackKind::Video),
            ],
        );
        for track in stream.tracks() {
            peer.add_track(Arc::clone(track), &stream)
                .await
                .expect("add track");
        }
        assert!(peer.local_track("mic").is_some());
        assert!(peer.local_track("cam").is_some());

        let offer = peer
            .create_offer(OfferOptions::default())
            .await
            .expect("offer");
        assert!(offer.sdp.contains("a=sendrecv"));
        assert!(!offer.sdp.contains("a=recvonly"));
        peer.set_local_description(offer.clone())
            .await
            .expect("set local");
        let local = peer.local_description().await.expect("local description");
        assert_eq!(local.kind, SdpType::Offer);
        peer.close().await.expect("close");
    }

    #[test_timeout::timeout]
    fn rollback_is_rejected() {
        let err = rtc_description(SessionDescription {
            kind: SdpType::Rollback,
            sdp: String::new(),
        })
        .unwrap_err();
        assert!(matches!(err, PeerError::InvalidDescription(_)));
    }

    #[test_timeout::timeout]
    fn ice_server_credentials_carry_over() {
        let server = IceServer::new("turn:turn.example.org:3478").with_credentials("u", "p");
        let rtc = rtc_ice_server(&server);
        assert_eq!(rtc.urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc.username, "u");
        assert_eq!(rtc.credential, "p");
    }
}
