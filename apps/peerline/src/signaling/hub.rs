use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_bus::{Bus, Envelope};
use tracing::trace;

use super::{InboundSignal, SignalMessage, Signaling, SignalingError};

/// [`Signaling`] over a participant-addressed [`Bus`]. The session id
/// travels as the envelope topic.
#[derive(Clone)]
pub struct HubSignaling {
    participant: String,
    bus: Arc<dyn Bus>,
}

impl HubSignaling {
    pub fn new(participant: impl Into<String>, bus: Arc<dyn Bus>) -> Self {
        Self {
            participant: participant.into(),
            bus,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }
}

#[async_trait]
impl Signaling for HubSignaling {
    async fn send(
        &self,
        remote: &str,
        session_id: &str,
        message: SignalMessage,
    ) -> Result<(), SignalingError> {
        let payload = serde_json::to_vec(&message)?;
        trace!(
            target = "peerline::signaling",
            from = %self.participant,
            to = remote,
            session_id,
            kind = message.name(),
            bytes = payload.len(),
            "posting signal"
        );
        self.bus.post(Envelope {
            from: self.participant.clone(),
            to: remote.to_owned(),
            topic: session_id.to_owned(),
            payload: Bytes::from(payload),
        })?;
        Ok(())
    }
}

pub fn decode_envelope(envelope: &Envelope) -> Result<InboundSignal, SignalingError> {
    let message = serde_json::from_slice(&envelope.payload)?;
    Ok(InboundSignal {
        from: envelope.from.clone(),
        session_id: envelope.topic.clone(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::IceCandidate;
    use signal_bus::LocalHub;

    #[tokio::test]
    async fn messages_arrive_decoded_and_in_order() {
        let hub = Arc::new(LocalHub::new());
        let mut bob = hub.register("bob").unwrap();
        let alice = HubSignaling::new("alice", hub.clone());

        alice
            .send_ice("bob", "s1", IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"))
            .await
            .unwrap();
        alice.send_bye("bob", "s1", None).await.unwrap();

        let first = decode_envelope(&bob.recv().await.unwrap()).unwrap();
        assert_eq!(first.from, "alice");
        assert_eq!(first.session_id, "s1");
        assert!(matches!(first.message, SignalMessage::Ice { .. }));
        let second = decode_envelope(&bob.recv().await.unwrap()).unwrap();
        assert_eq!(second.message, SignalMessage::Bye { data: None });
    }

    #[tokio::test]
    async fn unknown_remote_is_a_bus_error() {
        let hub = Arc::new(LocalHub::new());
        let alice = HubSignaling::new("alice", hub);
        let err = alice.send_bye("nobody", "s1", None).await.unwrap_err();
        assert!(matches!(err, SignalingError::Bus(_)));
    }
}
