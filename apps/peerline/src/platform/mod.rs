//! Seam between the session state machine and the peer-connection
//! primitive. `rtc` adapts webrtc-rs; `mock` is an in-process scripted
//! stand-in used by tests.

pub mod mock;
pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::ice::{IceCandidate, IceServer};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("channel cannot accept data right now")]
    WouldBlock,
    #[error("platform object is closed")]
    Closed,
    #[error("platform rejected the operation: {0}")]
    Rejected(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Opaque media stream descriptor handed to the platform as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<MediaTrack>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
    /// Pre-agreed stream id; both peers create the channel themselves.
    pub negotiated_id: Option<u16>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            negotiated_id: None,
        }
    }
}

impl ChannelConfig {
    pub fn negotiated(id: u16) -> Self {
        Self {
            negotiated_id: Some(id),
            ..Self::default()
        }
    }
}

pub enum PlatformEvent {
    IceCandidateFound(IceCandidate),
    SignalingStateChanged(SignalingState),
    IceConnectionStateChanged(IceConnectionState),
    StreamAdded(MediaStream),
    DataChannelCreated(Arc<dyn ChannelHandle>),
}

impl fmt::Debug for PlatformEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidateFound(c) => f.debug_tuple("IceCandidateFound").field(c).finish(),
            Self::SignalingStateChanged(s) => {
                f.debug_tuple("SignalingStateChanged").field(s).finish()
            }
            Self::IceConnectionStateChanged(s) => {
                f.debug_tuple("IceConnectionStateChanged").field(s).finish()
            }
            Self::StreamAdded(s) => f.debug_tuple("StreamAdded").field(&s.id).finish(),
            Self::DataChannelCreated(c) => {
                f.debug_tuple("DataChannelCreated").field(&c.label()).finish()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelNotification {
    StateChanged(ChannelState),
    Message(Bytes),
    Error(String),
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn label(&self) -> String;

    fn state(&self) -> ChannelState;

    /// Routes this channel's notifications to `notifications`. Anything the
    /// channel reported before binding is replayed first.
    fn bind(&self, notifications: mpsc::UnboundedSender<ChannelNotification>);

    /// Hands one frame to the channel. `WouldBlock` means retry later.
    async fn send(&self, frame: Bytes) -> Result<(), PlatformError>;

    async fn close(&self) -> Result<(), PlatformError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PlatformError>;

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), PlatformError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), PlatformError>;

    async fn create_data_channel(
        &self,
        label: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>, PlatformError>;

    fn signaling_state(&self) -> SignalingState;

    async fn close(&self) -> Result<(), PlatformError>;
}

/// Builds one primitive per session; its notifications go to `events`.
#[async_trait]
pub trait PlatformFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PlatformError>;
}
