use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// One addressed message travelling through the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("participant {0} is not registered")]
    UnknownParticipant(String),
    #[error("participant {0} is already registered")]
    AlreadyRegistered(String),
    #[error("bus channel closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn post(&self, envelope: Envelope) -> BusResult<()>;
}

/// In-memory participant-addressed hub. Every registered participant owns a
/// mailbox; delivery between any two participants preserves posting order.
#[derive(Debug, Default)]
pub struct LocalHub {
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, participant: &str) -> BusResult<Mailbox> {
        let mut guard = self.mailboxes.write();
        if let Some(existing) = guard.get(participant) {
            if !existing.is_closed() {
                return Err(BusError::AlreadyRegistered(participant.to_string()));
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        guard.insert(participant.to_string(), tx);
        Ok(Mailbox {
            participant: participant.to_string(),
            rx,
        })
    }

    /// Drops the participant's sender so its mailbox drains and then ends.
    pub fn unregister(&self, participant: &str) -> bool {
        self.mailboxes.write().remove(participant).is_some()
    }
}

impl Bus for LocalHub {
    fn post(&self, envelope: Envelope) -> BusResult<()> {
        let sender = self
            .mailboxes
            .read()
            .get(&envelope.to)
            .cloned()
            .ok_or_else(|| BusError::UnknownParticipant(envelope.to.clone()))?;
        let to = envelope.to.clone();
        sender.send(envelope).map_err(|_| {
            debug!(target = "signal_bus", participant = %to, "mailbox dropped; unregistering");
            self.mailboxes.write().remove(&to);
            BusError::Closed
        })
    }
}

#[derive(Debug)]
pub struct Mailbox {
    participant: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Mailbox {
    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(from: &str, to: &str, body: &'static [u8]) -> Envelope {
        Envelope {
            from: from.into(),
            to: to.into(),
            topic: "session-1".into(),
            payload: Bytes::from_static(body),
        }
    }

    #[tokio::test]
    async fn hub_round_trip() {
        let hub = LocalHub::new();
        let mut bob = hub.register("bob").expect("register bob");
        hub.post(envelope("alice", "bob", b"ping"))
            .expect("post ok");
        let msg = bob.recv().await.expect("receive ok");
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.topic, "session-1");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn delivery_preserves_order() {
        let hub = LocalHub::new();
        let mut bob = hub.register("bob").expect("register bob");
        hub.post(envelope("alice", "bob", b"1")).unwrap();
        hub.post(envelope("alice", "bob", b"2")).unwrap();
        hub.post(envelope("alice", "bob", b"3")).unwrap();
        let mut seen = Vec::new();
        while let Some(msg) = bob.try_recv() {
            seen.push(msg.payload);
        }
        assert_eq!(
            seen,
            vec![
                Bytes::from_static(b"1"),
                Bytes::from_static(b"2"),
                Bytes::from_static(b"3")
            ]
        );
    }

    #[test]
    fn posting_to_unknown_participant_fails() {
        let hub = LocalHub::new();
        let err = hub.post(envelope("alice", "carol", b"x")).unwrap_err();
        assert_eq!(err, BusError::UnknownParticipant("carol".into()));
    }

    #[test]
    fn duplicate_registration_is_rejected_while_mailbox_alive() {
        let hub = LocalHub::new();
        let first = hub.register("bob").expect("first");
        assert_eq!(
            hub.register("bob").unwrap_err(),
            BusError::AlreadyRegistered("bob".into())
        );
        drop(first);
        let _second = hub.register("bob").expect("re-register after drop");
        assert!(hub.post(envelope("alice", "bob", b"x")).is_ok());
    }

    #[test]
    fn dropped_mailbox_reports_closed() {
        let hub = LocalHub::new();
        drop(hub.register("bob").expect("register"));
        assert_eq!(hub.post(envelope("alice", "bob", b"x")).unwrap_err(), BusError::Closed);
        assert_eq!(
            hub.post(envelope("alice", "bob", b"y")).unwrap_err(),
            BusError::UnknownParticipant("bob".into())
        );
    }

    #[tokio::test]
    async fn unregister_ends_the_mailbox_after_queued_mail() {
        let hub = LocalHub::new();
        let mut bob = hub.register("bob").expect("register bob");
        hub.post(envelope("alice", "bob", b"last")).unwrap();
        assert!(hub.unregister("bob"));
        assert!(!hub.unregister("bob"));
        assert_eq!(bob.recv().await.expect("queued mail").payload, Bytes::from_static(b"last"));
        assert!(bob.recv().await.is_none());
    }
}
