use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{ConnectionState, GatheringState, PeerConnection, PeerError, PeerEvent};
use crate::codec::{ConnectivityCandidate, SdpKind, SessionDescription};
use crate::dispatch::Dispatcher;

const VIDEO_TRACK_ID: &str = "video";
const MEDIA_STREAM_ID: &str = "publish";

/// [`PeerConnection`] backed by the `webrtc` crate, carrying one outbound
/// H.264 video track. Frames are written to [`RtcPeer::video_track`] by the
/// caller's capture pipeline.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticSample>,
}

impl RtcPeer {
    pub async fn new(ice_servers: &[String], dispatcher: Dispatcher) -> Result<Self, PeerError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_server_config(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            VIDEO_TRACK_ID.to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ));
        let sender = pc
            .add_track(Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // RTCP has to be drained for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        register_callbacks(&pc, dispatcher);
        tracing::debug!(
            target = "publish",
            ice_servers = ice_servers.len(),
            "peer connection created"
        );
        Ok(Self { pc, video })
    }

    pub fn video_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.video)
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc_description(offer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: ConnectivityCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(to_candidate_init(candidate)).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::warn!(target = "publish", error = %err, "peer connection close failed");
        }
    }
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_server_config(urls: &[String]) -> Vec<RTCIceServer> {
    if urls.is_empty() {
        return Vec::new();
    }
    vec![RTCIceServer {
        urls: urls.to_vec(),
        ..Default::default()
    }]
}

fn register_callbacks(pc: &RTCPeerConnection, dispatcher: Dispatcher) {
    let candidates = dispatcher.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let dispatcher = candidates.clone();
        Box::pin(async move {
            // End of gathering arrives through the gathering state callback.
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    dispatcher.post_peer(PeerEvent::LocalCandidate(from_candidate_init(init)));
                }
                Err(err) => {
                    tracing::warn!(
                        target = "publish",
                        error = %err,
                        "failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let gathering = dispatcher.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
        gathering.post_peer(PeerEvent::GatheringStateChanged(gathering_state(state)));
        Box::pin(async {})
    }));

    let states = dispatcher;
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        states.post_peer(PeerEvent::ConnectionStateChanged(connection_state(state)));
        Box::pin(async {})
    }));
}

fn gathering_state(state: RTCIceGathererState) -> GatheringState {
    match state {
        RTCIceGathererState::Unspecified | RTCIceGathererState::New => GatheringState::New,
        RTCIceGathererState::Gathering => GatheringState::Gathering,
        // A closed gatherer produces no further candidates.
        RTCIceGathererState::Complete | RTCIceGathererState::Closed => GatheringState::Complete,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(PeerError::from)
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError(format!("unsupported sdp type {other:?}"))),
    }
}

fn to_candidate_init(candidate: ConnectivityCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> ConnectivityCandidate {
    ConnectivityCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
    }
}
