use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use ::webrtc::api::{API, APIBuilder};
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::data_channel_state::RTCDataChannelState;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::signaling_state::RTCSignalingState;
use ::webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    ChannelConfig, ChannelHandle, ChannelNotification, ChannelState, IceConnectionState,
    MediaKind, MediaStream, MediaTrack, PeerTransport, PlatformError, PlatformEvent,
    PlatformFactory, SdpKind, SessionDescription, SignalingState,
};
use crate::ice::{IceCandidate, IceServer};

/// Bytes queued inside the SCTP stack above which sends report `WouldBlock`.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 1024 * 1024;

fn rejected(err: impl std::fmt::Display) -> PlatformError {
    PlatformError::Rejected(err.to_string())
}

fn build_api() -> Result<API, PlatformError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(rejected)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(rejected)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_rtc_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.url.clone()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn map_signaling(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn map_ice(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PlatformError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(rejected),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(rejected),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(rejected),
        SdpKind::Rollback => Err(PlatformError::Unsupported("sdp rollback".into())),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp,
    }
}

/// [`PlatformFactory`] backed by webrtc-rs peer connections.
#[derive(Debug, Clone)]
pub struct RtcPlatform {
    max_buffered_bytes: usize,
}

impl Default for RtcPlatform {
    fn default() -> Self {
        Self {
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl RtcPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffered_bytes(mut self, bytes: usize) -> Self {
        self.max_buffered_bytes = bytes.max(1);
        self
    }
}

#[async_trait]
impl PlatformFactory for RtcPlatform {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PlatformError> {
        let api = build_api()?;
        let config = RTCConfiguration {
            ice_servers: to_rtc_servers(ice_servers),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(rejected)?);
        install_handlers(&pc, events, self.max_buffered_bytes);
        Ok(Arc::new(RtcPeer {
            pc,
            max_buffered_bytes: self.max_buffered_bytes,
            tracks: Mutex::new(Vec::new()),
        }))
    }
}

fn install_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PlatformEvent>,
    max_buffered_bytes: usize,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                trace!(target = "peerline::platform::rtc", "ice gathering complete");
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PlatformEvent::IceCandidateFound(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(err) => {
                    warn!(target = "peerline::platform::rtc", error = %err, "failed to serialize local candidate");
                }
            }
        })
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let _ = tx.send(PlatformEvent::SignalingStateChanged(map_signaling(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        debug!(target = "peerline::platform::rtc", ?state, "ice connection state changed");
        let _ = tx.send(PlatformEvent::IceConnectionStateChanged(map_ice(state)));
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let _ = tx.send(PlatformEvent::StreamAdded(MediaStream {
            id: track.stream_id(),
            tracks: vec![MediaTrack {
                id: track.id(),
                kind,
            }],
        }));
        Box::pin(async {})
    }));

    let tx = events;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        debug!(target = "peerline::platform::rtc", label = dc.label(), "remote data channel announced");
        let handle = Arc::new(RtcChannel {
            dc,
            max_buffered_bytes,
        });
        let _ = tx.send(PlatformEvent::DataChannelCreated(handle));
        Box::pin(async {})
    }));
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    max_buffered_bytes: usize,
    tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
}

#[async_trait]
impl PeerTransport for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PlatformError> {
        let offer = self.pc.create_offer(None).await.map_err(rejected)?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError> {
        let answer = self.pc.create_answer(None).await.map_err(rejected)?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_local_description(desc).await.map_err(rejected)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(rejected)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(rejected)
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), PlatformError> {
        for track in &stream.tracks {
            let mime_type = match track.kind {
                MediaKind::Audio => MIME_TYPE_OPUS,
                MediaKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                stream.id.clone(),
            ));
            self.pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rejected)?;
            self.tracks.lock().push(local);
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>, PlatformError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            negotiated: config.negotiated_id,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(rejected)?;
        Ok(Arc::new(RtcChannel {
            dc,
            max_buffered_bytes: self.max_buffered_bytes,
        }))
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.tracks.lock().clear();
        self.pc.close().await.map_err(rejected)
    }
}

pub struct RtcChannel {
    dc: Arc<RTCDataChannel>,
    max_buffered_bytes: usize,
}

#[async_trait]
impl ChannelHandle for RtcChannel {
    fn label(&self) -> String {
        self.dc.label().to_owned()
    }

    fn state(&self) -> ChannelState {
        map_channel_state(self.dc.ready_state())
    }

    fn bind(&self, notifications: mpsc::UnboundedSender<ChannelNotification>) {
        let tx = notifications.clone();
        self.dc.on_open(Box::new(move || {
            let _ = tx.send(ChannelNotification::StateChanged(ChannelState::Open));
            Box::pin(async {})
        }));

        let tx = notifications.clone();
        self.dc.on_close(Box::new(move || {
            let _ = tx.send(ChannelNotification::StateChanged(ChannelState::Closed));
            Box::pin(async {})
        }));

        let tx = notifications.clone();
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let _ = tx.send(ChannelNotification::Message(msg.data));
            Box::pin(async {})
        }));

        let tx = notifications.clone();
        self.dc.on_error(Box::new(move |err| {
            let _ = tx.send(ChannelNotification::Error(err.to_string()));
            Box::pin(async {})
        }));

        // on_open never fires for a channel that opened before binding.
        if self.dc.ready_state() == RTCDataChannelState::Open {
            let _ = notifications.send(ChannelNotification::StateChanged(ChannelState::Open));
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), PlatformError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Connecting => return Err(PlatformError::WouldBlock),
            ChannelState::Closing | ChannelState::Closed => return Err(PlatformError::Closed),
        }
        if self.dc.buffered_amount().await > self.max_buffered_bytes {
            return Err(PlatformError::WouldBlock);
        }
        self.dc.send(&frame).await.map(|_| ()).map_err(rejected)
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.dc.close().await.map_err(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_limit_is_at_least_one_byte() {
        assert_eq!(RtcPlatform::new().max_buffered_bytes, DEFAULT_MAX_BUFFERED_BYTES);
        assert_eq!(RtcPlatform::new().with_max_buffered_bytes(0).max_buffered_bytes, 1);
        assert_eq!(
            RtcPlatform::new().with_max_buffered_bytes(4096).max_buffered_bytes,
            4096
        );
    }
}
