use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use signal_bus::Mailbox;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::{PeerSession, SessionDeps};
use crate::signaling::hub::decode_envelope;
use crate::signaling::{InboundSignal, SignalMessage, UserContext};
use crate::transport::chunk::ChunkConfig;

/// Called for every responder session before its offer is handled, so the
/// application can register channels or attach accept data.
pub type Acceptor = Arc<dyn Fn(&PeerSession) + Send + Sync>;

/// One local participant. Creates initiator sessions, spawns responder
/// sessions for inbound offers and routes signaling by session id.
pub struct Endpoint {
    user: UserContext,
    deps: SessionDeps,
    config: SessionConfig,
    chunk: ChunkConfig,
    sessions: Mutex<HashMap<String, PeerSession>>,
    acceptor: Option<Acceptor>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("participant", &self.user.name)
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

impl Endpoint {
    pub fn new(user: UserContext, deps: SessionDeps, config: SessionConfig, chunk: ChunkConfig) -> Self {
        Self {
            user,
            deps,
            config,
            chunk,
            sessions: Mutex::new(HashMap::new()),
            acceptor: None,
        }
    }

    pub fn with_acceptor<F>(mut self, acceptor: F) -> Self
    where
        F: Fn(&PeerSession) + Send + Sync + 'static,
    {
        self.acceptor = Some(Arc::new(acceptor));
        self
    }

    pub fn participant(&self) -> &str {
        &self.user.name
    }

    /// New initiator session towards `remote`; call `open` on it to start.
    pub fn connect(&self, remote: &str) -> PeerSession {
        let session = self.build(Uuid::new_v4().to_string(), remote);
        self.sessions
            .lock()
            .insert(session.id().to_owned(), session.clone());
        debug!(
            target = "peerline::endpoint",
            participant = %self.user.name,
            session_id = %session.id(),
            remote,
            "session created"
        );
        session
    }

    pub fn session(&self, id: &str) -> Option<PeerSession> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<PeerSession> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Routes one inbound message. An offer for an unknown session id
    /// creates a responder session; anything else for an unknown id is
    /// dropped.
    pub async fn dispatch(&self, signal: InboundSignal) -> SessionResult<()> {
        self.prune();
        let InboundSignal {
            from,
            session_id,
            message,
        } = signal;

        let existing = self.session(&session_id);
        let session = match existing {
            Some(session) if session.remote() != from => {
                warn!(
                    target = "peerline::endpoint",
                    session_id = %session_id,
                    expected = %session.remote(),
                    from = %from,
                    "dropping signal from unexpected participant"
                );
                return Err(SessionError::invalid_argument(
                    "dispatch",
                    format!("session {session_id} belongs to {}", session.remote()),
                ));
            }
            Some(session) => session,
            None if matches!(message, SignalMessage::Offer(_)) => self.accept(&session_id, &from),
            None => {
                trace!(
                    target = "peerline::endpoint",
                    session_id = %session_id,
                    signal = message.name(),
                    "dropping signal for unknown session"
                );
                return Ok(());
            }
        };
        session.handle_signal(message).await
    }

    fn accept(&self, session_id: &str, from: &str) -> PeerSession {
        let session = self.build(session_id.to_owned(), from);
        if let Some(acceptor) = &self.acceptor {
            acceptor(&session);
        }
        self.sessions
            .lock()
            .insert(session_id.to_owned(), session.clone());
        debug!(
            target = "peerline::endpoint",
            participant = %self.user.name,
            session_id,
            remote = from,
            "responder session created"
        );
        session
    }

    fn build(&self, id: String, remote: &str) -> PeerSession {
        PeerSession::new(
            id,
            remote,
            self.user.clone(),
            self.deps.clone(),
            self.config.clone(),
            self.chunk,
        )
    }

    fn prune(&self) {
        self.sessions.lock().retain(|_, session| !session.is_closed());
    }
}

/// Feeds everything arriving in `mailbox` into `endpoint`, in order.
pub fn spawn_mailbox_pump(endpoint: Arc<Endpoint>, mut mailbox: Mailbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = mailbox.recv().await {
            let signal = match decode_envelope(&envelope) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(
                        target = "peerline::endpoint",
                        participant = %mailbox.participant(),
                        from = %envelope.from,
                        error = %err,
                        "dropping undecodable signal"
                    );
                    continue;
                }
            };
            if let Err(err) = endpoint.dispatch(signal).await {
                debug!(
                    target = "peerline::endpoint",
                    participant = %endpoint.participant(),
                    error = %err,
                    "signal handling failed"
                );
            }
        }
        debug!(target = "peerline::endpoint", participant = %endpoint.participant(), "mailbox closed");
    })
}
