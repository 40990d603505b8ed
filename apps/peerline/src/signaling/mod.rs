//! Messages exchanged with the remote peer through the signaling
//! collaborator, and the collaborator seams themselves.

pub mod credentials;
pub mod hub;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ice::{IceCandidate, IceServer};
use crate::platform::SessionDescription;
use crate::policy::CandidatePolicy;

pub use credentials::{HttpIceServerProvider, IceServerProvider, StaticIceServers, UserContext};
pub use hub::HubSignaling;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub offer: SessionDescription,
    #[serde(default)]
    pub connection_type: CandidatePolicy,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: SessionDescription,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer(OfferPayload),
    Answer(AnswerPayload),
    Ice {
        candidate: IceCandidate,
    },
    Bye {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl SignalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offer(_) => "offer",
            Self::Answer(_) => "answer",
            Self::Ice { .. } => "ice",
            Self::Bye { .. } => "bye",
        }
    }
}

/// A decoded message addressed to one of our sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub from: String,
    pub session_id: String,
    pub message: SignalMessage,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling bus error: {0}")]
    Bus(#[from] signal_bus::BusError),
    #[error("signal encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Outbound half of the signaling collaborator. Delivery between two
/// participants must preserve order.
#[async_trait]
pub trait Signaling: Send + Sync {
    async fn send(
        &self,
        remote: &str,
        session_id: &str,
        message: SignalMessage,
    ) -> Result<(), SignalingError>;

    async fn send_offer(
        &self,
        remote: &str,
        session_id: &str,
        payload: OfferPayload,
    ) -> Result<(), SignalingError> {
        self.send(remote, session_id, SignalMessage::Offer(payload))
            .await
    }

    async fn send_answer(
        &self,
        remote: &str,
        session_id: &str,
        payload: AnswerPayload,
    ) -> Result<(), SignalingError> {
        self.send(remote, session_id, SignalMessage::Answer(payload))
            .await
    }

    async fn send_ice(
        &self,
        remote: &str,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        self.send(remote, session_id, SignalMessage::Ice { candidate })
            .await
    }

    async fn send_bye(
        &self,
        remote: &str,
        session_id: &str,
        data: Option<Value>,
    ) -> Result<(), SignalingError> {
        self.send(remote, session_id, SignalMessage::Bye { data })
            .await
    }
}
