use crate::channel::DataChannelSession;
use crate::error::SessionError;
use crate::ice::IceCandidate;
use crate::platform::{ChannelConfig, IceConnectionState, MediaStream, SignalingState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `PeerSession::close` was called.
    Local,
    /// The remote participant said bye.
    RemoteBye,
    /// The transport stayed disconnected for the whole grace period.
    Disconnected,
}

/// Notifications published on [`PeerSession::subscribe`](super::PeerSession::subscribe).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opening,
    Establishing,
    Established,
    Closed(CloseReason),
    LocalStreamAdded(MediaStream),
    RemoteStreamAdded(MediaStream),
    /// Published once the underlying channel reports open.
    ChannelCreated(DataChannelSession),
    ChannelCreationFailed {
        name: String,
        config: ChannelConfig,
        error: SessionError,
    },
    StateChanged(SignalingState),
    IceStateChanged(IceConnectionState),
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    IceSent(IceCandidate),
    IceReceived(IceCandidate),
    Error(SessionError),
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Establishing => "establishing",
            Self::Established => "established",
            Self::Closed(_) => "closed",
            Self::LocalStreamAdded(_) => "local_stream_added",
            Self::RemoteStreamAdded(_) => "remote_stream_added",
            Self::ChannelCreated(_) => "channel_created",
            Self::ChannelCreationFailed { .. } => "channel_creation_failed",
            Self::StateChanged(_) => "state_changed",
            Self::IceStateChanged(_) => "ice_state_changed",
            Self::OfferSent => "offer_sent",
            Self::OfferReceived => "offer_received",
            Self::AnswerSent => "answer_sent",
            Self::AnswerReceived => "answer_received",
            Self::IceSent(_) => "ice_sent",
            Self::IceReceived(_) => "ice_received",
            Self::Error(_) => "error",
        }
    }
}
