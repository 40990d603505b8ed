//! Peer session handshake. A [`PeerSession`] drives the offer/answer
//! exchange through the signaling collaborator, holds outbound candidates
//! until that exchange completes, owns its data channels and tears all of
//! it down exactly once.

mod debounce;
mod events;
mod gate;
mod state;

pub use debounce::DisconnectDebounce;
pub use events::{CloseReason, SessionEvent};
pub use gate::CandidateGate;
pub use state::SessionPhase;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::DataChannelSession;
use crate::config::SessionConfig;
use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::ice::{IceCandidate, IceServer, normalize_servers};
use crate::platform::{
    ChannelConfig, ChannelHandle, ChannelState, IceConnectionState, MediaStream, PeerTransport,
    PlatformError, PlatformEvent, PlatformFactory, SessionDescription, SignalingState,
};
use crate::policy::{CandidatePolicy, CandidatePolicyFilter, resolve_turn_address};
use crate::signaling::{
    AnswerPayload, IceServerProvider, OfferPayload, SignalMessage, Signaling, SignalingError,
    UserContext,
};
use crate::transport::chunk::ChunkConfig;

const EVENT_CAPACITY: usize = 512;

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub signaling: Arc<dyn Signaling>,
    pub credentials: Arc<dyn IceServerProvider>,
    pub platform: Arc<dyn PlatformFactory>,
}

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Falls back to the configured connection type.
    pub connection_type: Option<CandidatePolicy>,
    pub connection_data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone)]
pub struct PeerSession {
    shared: Arc<Shared>,
}

struct Shared {
    id: String,
    remote: String,
    user: UserContext,
    config: SessionConfig,
    chunk: ChunkConfig,
    deps: SessionDeps,
    inner: Mutex<Inner>,
    gate: tokio::sync::Mutex<CandidateGate>,
    phase: watch::Sender<SessionPhase>,
    events: broadcast::Sender<SessionEvent>,
}

struct Inner {
    role: Option<Role>,
    filter: CandidatePolicyFilter,
    ice_servers: Option<Vec<IceServer>>,
    transport: Option<Arc<dyn PeerTransport>>,
    local_streams: Vec<MediaStream>,
    remote_streams: Vec<MediaStream>,
    registered: Vec<(String, ChannelConfig)>,
    channels: Vec<DataChannelSession>,
    remote_description_set: bool,
    remote_candidates: VecDeque<IceCandidate>,
    accept_data: Option<Value>,
    debounce: DisconnectDebounce,
    event_loop: Option<JoinHandle<()>>,
    watchers: Vec<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(task) = inner.event_loop.take() {
            task.abort();
        }
        for task in inner.watchers.drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.remote)
            .field("phase", &self.state())
            .finish()
    }
}

impl PeerSession {
    pub fn new(
        id: impl Into<String>,
        remote: impl Into<String>,
        user: UserContext,
        deps: SessionDeps,
        config: SessionConfig,
        chunk: ChunkConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SessionPhase::NotOpened);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            role: None,
            filter: CandidatePolicyFilter::new(config.connection_type, None),
            ice_servers: None,
            transport: None,
            local_streams: Vec::new(),
            remote_streams: Vec::new(),
            registered: Vec::new(),
            channels: Vec::new(),
            remote_description_set: false,
            remote_candidates: VecDeque::new(),
            accept_data: None,
            debounce: DisconnectDebounce::new(config.disconnect_grace),
            event_loop: None,
            watchers: Vec::new(),
        };
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                remote: remote.into(),
                user,
                config,
                chunk,
                deps,
                inner: Mutex::new(inner),
                gate: tokio::sync::Mutex::new(CandidateGate::new()),
                phase,
                events,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn remote(&self) -> &str {
        &self.shared.remote
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.inner.lock().role
    }

    pub fn state(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn connection_type(&self) -> CandidatePolicy {
        self.shared.inner.lock().filter.policy()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves once the session reaches `target` or any later phase.
    pub async fn wait_for_phase(&self, target: SessionPhase) -> SessionPhase {
        let mut rx = self.shared.phase.subscribe();
        match rx.wait_for(|phase| *phase >= target).await {
            Ok(phase) => *phase,
            Err(_) => self.state(),
        }
    }

    /// Signaling state reported by the platform primitive.
    pub fn signaling_state(&self) -> SignalingState {
        let transport = self.shared.inner.lock().transport.clone();
        match transport {
            Some(transport) => transport.signaling_state(),
            None if self.is_closed() => SignalingState::Closed,
            None => SignalingState::Stable,
        }
    }

    pub fn local_streams(&self) -> Vec<MediaStream> {
        self.shared.inner.lock().local_streams.clone()
    }

    pub fn remote_streams(&self) -> Vec<MediaStream> {
        self.shared.inner.lock().remote_streams.clone()
    }

    pub fn data_channels(&self) -> Vec<DataChannelSession> {
        self.shared.inner.lock().channels.clone()
    }

    pub fn channel(&self, name: &str) -> Option<DataChannelSession> {
        self.shared
            .inner
            .lock()
            .channels
            .iter()
            .find(|channel| channel.name() == name)
            .cloned()
    }

    /// Candidates held back until the offer/answer exchange completes.
    pub async fn pending_candidates(&self) -> usize {
        self.shared.gate.lock().await.pending_len()
    }

    pub fn add_stream(&self, stream: MediaStream) -> SessionResult<()> {
        {
            let mut inner = self.shared.inner.lock();
            self.ensure_not_opened("add_stream")?;
            inner.local_streams.push(stream.clone());
        }
        debug!(target = "peerline::session", session_id = %self.shared.id, stream = %stream.id, "local stream added");
        self.emit(SessionEvent::LocalStreamAdded(stream));
        Ok(())
    }

    pub fn register_data_channel(&self, name: &str) -> SessionResult<()> {
        self.register_data_channel_with(name, self.shared.config.channel_defaults)
    }

    /// Registers a channel to create when the session opens. A responder
    /// creates negotiated channels itself and adopts the others when the
    /// remote announces them.
    pub fn register_data_channel_with(&self, name: &str, config: ChannelConfig) -> SessionResult<()> {
        if name.trim().is_empty() {
            return Err(SessionError::invalid_argument(
                "register_data_channel",
                "channel name must not be empty",
            ));
        }
        let mut inner = self.shared.inner.lock();
        self.ensure_not_opened("register_data_channel")?;
        if inner.registered.iter().any(|(registered, _)| registered == name) {
            return Err(SessionError::invalid_state(
                "register_data_channel",
                format!("channel {name} is already registered"),
            ));
        }
        inner.registered.push((name.to_owned(), config));
        Ok(())
    }

    /// Opaque data attached to the answer this session sends as responder.
    pub fn set_accept_data(&self, data: Value) {
        self.shared.inner.lock().accept_data = Some(data);
    }

    /// Starts the handshake as initiator.
    pub async fn open(&self, options: OpenOptions) -> SessionResult<()> {
        let policy = options
            .connection_type
            .unwrap_or(self.shared.config.connection_type);
        if !self.advance(SessionPhase::Opening) {
            return Err(SessionError::invalid_state(
                "open",
                format!("session is already {}", self.state()),
            ));
        }
        {
            let mut inner = self.shared.inner.lock();
            inner.role = Some(Role::Initiator);
            inner.filter = CandidatePolicyFilter::new(policy, None);
        }
        info!(
            target = "peerline::session",
            session_id = %self.shared.id,
            remote = %self.shared.remote,
            policy = %policy,
            "opening session"
        );
        self.emit(SessionEvent::Opening);

        let Some(transport) = self.prepare_transport(Vec::new()).await? else {
            return Ok(());
        };
        let offer = transport.create_offer().await.map_err(|err| {
            self.report(
                SessionError::new(
                    ErrorKind::OfferCreationFailed,
                    "create_offer",
                    "platform failed to create an offer",
                )
                .with_cause(err),
            )
        })?;
        if self.is_closed() {
            return Ok(());
        }
        let offer = self.filtered(offer);
        transport
            .set_local_description(offer.clone())
            .await
            .map_err(|err| self.platform_failure("set_local_description", err))?;
        if self.is_closed() {
            return Ok(());
        }

        let ice_servers = self.shared.inner.lock().ice_servers.clone().unwrap_or_default();
        let payload = OfferPayload {
            offer,
            connection_type: policy,
            ice_servers,
            connection_data: options.connection_data,
        };
        self.shared
            .deps
            .signaling
            .send_offer(&self.shared.remote, &self.shared.id, payload)
            .await
            .map_err(|err| self.signaling_failure("send_offer", err))?;
        debug!(target = "peerline::session", session_id = %self.shared.id, "offer sent");
        self.emit(SessionEvent::OfferSent);
        if self.advance(SessionPhase::Establishing) {
            self.emit(SessionEvent::Establishing);
        }
        Ok(())
    }

    /// Applies one inbound signaling message.
    pub async fn handle_signal(&self, message: SignalMessage) -> SessionResult<()> {
        if self.is_closed() {
            trace!(
                target = "peerline::session",
                session_id = %self.shared.id,
                signal = message.name(),
                "dropping signal for closed session"
            );
            return Ok(());
        }
        match message {
            SignalMessage::Offer(payload) => self.accept_offer(payload).await,
            SignalMessage::Answer(payload) => self.accept_answer(payload).await,
            SignalMessage::Ice { candidate } => {
                self.accept_candidate(candidate).await;
                Ok(())
            }
            SignalMessage::Bye { data } => {
                debug!(
                    target = "peerline::session",
                    session_id = %self.shared.id,
                    data = ?data,
                    "remote said bye"
                );
                self.close_internal(CloseReason::RemoteBye, None).await;
                Ok(())
            }
        }
    }

    /// Sends bye (when the session was opened) and releases everything.
    /// Later calls are no-ops.
    pub async fn close(&self, data: Option<Value>) {
        self.close_internal(CloseReason::Local, data).await;
    }

    async fn accept_offer(&self, payload: OfferPayload) -> SessionResult<()> {
        if !self.advance(SessionPhase::Opening) {
            return Err(self.report(SessionError::invalid_state(
                "accept_offer",
                format!("cannot accept an offer while {}", self.state()),
            )));
        }
        {
            let mut inner = self.shared.inner.lock();
            inner.role = Some(Role::Responder);
            inner.filter = CandidatePolicyFilter::new(payload.connection_type, None);
        }
        info!(
            target = "peerline::session",
            session_id = %self.shared.id,
            remote = %self.shared.remote,
            policy = %payload.connection_type,
            "offer received"
        );
        self.emit(SessionEvent::OfferReceived);
        self.emit(SessionEvent::Opening);

        let Some(transport) = self.prepare_transport(payload.ice_servers).await? else {
            return Ok(());
        };
        transport
            .set_remote_description(payload.offer)
            .await
            .map_err(|err| self.platform_failure("set_remote_description", err))?;
        if self.is_closed() {
            return Ok(());
        }
        self.apply_queued_candidates(&transport).await;
        if self.advance(SessionPhase::Establishing) {
            self.emit(SessionEvent::Establishing);
        }

        let answer = transport.create_answer().await.map_err(|err| {
            self.report(
                SessionError::new(
                    ErrorKind::AnswerCreationFailed,
                    "create_answer",
                    "platform failed to create an answer",
                )
                .with_cause(err),
            )
        })?;
        if self.is_closed() {
            return Ok(());
        }
        let answer = self.filtered(answer);
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(|err| self.platform_failure("set_local_description", err))?;
        if self.is_closed() {
            return Ok(());
        }

        let accept_data = self.shared.inner.lock().accept_data.clone();
        self.shared
            .deps
            .signaling
            .send_answer(
                &self.shared.remote,
                &self.shared.id,
                AnswerPayload {
                    answer,
                    accept_data,
                },
            )
            .await
            .map_err(|err| self.signaling_failure("send_answer", err))?;
        debug!(target = "peerline::session", session_id = %self.shared.id, "answer sent");
        self.emit(SessionEvent::AnswerSent);
        self.open_gate().await;
        Ok(())
    }

    async fn accept_answer(&self, payload: AnswerPayload) -> SessionResult<()> {
        let (role, transport) = {
            let inner = self.shared.inner.lock();
            (inner.role, inner.transport.clone())
        };
        if role != Some(Role::Initiator) || self.state() >= SessionPhase::Established {
            return Err(self.report(SessionError::invalid_state(
                "accept_answer",
                format!("no offer outstanding while {}", self.state()),
            )));
        }
        let Some(transport) = transport else {
            return Err(self.report(SessionError::invalid_state(
                "accept_answer",
                "answer arrived before the offer was created",
            )));
        };
        debug!(target = "peerline::session", session_id = %self.shared.id, "answer received");
        self.emit(SessionEvent::AnswerReceived);
        transport
            .set_remote_description(payload.answer)
            .await
            .map_err(|err| self.platform_failure("set_remote_description", err))?;
        if self.is_closed() {
            return Ok(());
        }
        self.apply_queued_candidates(&transport).await;
        // The answer may overtake the initiator's own post-offer transition.
        if self.advance(SessionPhase::Establishing) {
            self.emit(SessionEvent::Establishing);
        }
        self.open_gate().await;
        Ok(())
    }

    async fn accept_candidate(&self, candidate: IceCandidate) {
        trace!(
            target = "peerline::session",
            session_id = %self.shared.id,
            candidate = %candidate.candidate,
            "remote candidate received"
        );
        self.emit(SessionEvent::IceReceived(candidate.clone()));
        let transport = {
            let mut inner = self.shared.inner.lock();
            if inner.remote_description_set {
                inner.transport.clone()
            } else {
                inner.remote_candidates.push_back(candidate.clone());
                None
            }
        };
        if let Some(transport) = transport {
            self.apply_candidate(&transport, candidate).await;
        }
    }

    async fn apply_queued_candidates(&self, transport: &Arc<dyn PeerTransport>) {
        let queued: Vec<IceCandidate> = {
            let mut inner = self.shared.inner.lock();
            inner.remote_description_set = true;
            inner.remote_candidates.drain(..).collect()
        };
        if !queued.is_empty() {
            debug!(
                target = "peerline::session",
                session_id = %self.shared.id,
                count = queued.len(),
                "applying queued remote candidates"
            );
        }
        for candidate in queued {
            if self.is_closed() {
                return;
            }
            self.apply_candidate(transport, candidate).await;
        }
    }

    async fn apply_candidate(&self, transport: &Arc<dyn PeerTransport>, candidate: IceCandidate) {
        if let Err(err) = transport.add_ice_candidate(candidate).await {
            self.platform_failure("add_ice_candidate", err);
        }
    }

    /// Fetches ICE servers, resolves the TURN address for the server policy,
    /// builds the platform primitive and attaches everything registered
    /// before open. `None` means the session closed in the meantime.
    async fn prepare_transport(
        &self,
        offered: Vec<IceServer>,
    ) -> SessionResult<Option<Arc<dyn PeerTransport>>> {
        let servers = self.resolve_ice_servers(offered).await?;
        if self.is_closed() {
            return Ok(None);
        }
        let policy = self.connection_type();
        let turn_address = if policy == CandidatePolicy::Server {
            let resolved = resolve_turn_address(&servers).await;
            if resolved.is_none() {
                warn!(
                    target = "peerline::session",
                    session_id = %self.shared.id,
                    "no TURN address known; reflexive candidates will be dropped"
                );
            }
            resolved
        } else {
            None
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = self
            .shared
            .deps
            .platform
            .create(&servers, events_tx)
            .await
            .map_err(|err| self.platform_failure("create_peer", err))?;

        let attached = {
            let mut inner = self.shared.inner.lock();
            if self.is_closed() {
                None
            } else {
                inner.filter = CandidatePolicyFilter::new(policy, turn_address);
                inner.transport = Some(Arc::clone(&transport));
                inner.event_loop = Some(tokio::spawn(run_platform_events(
                    Arc::downgrade(&self.shared),
                    events_rx,
                )));
                Some((inner.local_streams.clone(), inner.registered.clone(), inner.role))
            }
        };
        let Some((streams, registered, role)) = attached else {
            if let Err(err) = transport.close().await {
                warn!(target = "peerline::session", session_id = %self.shared.id, error = %err, "platform close failed");
            }
            return Ok(None);
        };
        debug!(
            target = "peerline::session",
            session_id = %self.shared.id,
            servers = servers.len(),
            streams = streams.len(),
            channels = registered.len(),
            "platform transport created"
        );

        for stream in streams {
            if self.is_closed() {
                return Ok(None);
            }
            if let Err(err) = transport.add_stream(&stream).await {
                self.platform_failure("add_stream", err);
            }
        }
        for (name, config) in registered {
            if role == Some(Role::Responder) && config.negotiated_id.is_none() {
                continue;
            }
            if self.is_closed() {
                return Ok(None);
            }
            match transport.create_data_channel(&name, &config).await {
                Ok(handle) => {
                    self.adopt_channel(handle).await;
                }
                Err(err) => {
                    let error = SessionError::new(
                        ErrorKind::DataChannelCreationFailed,
                        "create_data_channel",
                        format!("platform refused channel {name}"),
                    )
                    .with_cause(err);
                    warn!(
                        target = "peerline::session",
                        session_id = %self.shared.id,
                        channel = %name,
                        error = %error,
                        "data channel creation failed"
                    );
                    self.emit(SessionEvent::ChannelCreationFailed {
                        name,
                        config,
                        error,
                    });
                }
            }
        }
        Ok(Some(transport))
    }

    async fn resolve_ice_servers(&self, offered: Vec<IceServer>) -> SessionResult<Vec<IceServer>> {
        let cached = self.shared.inner.lock().ice_servers.clone();
        if let Some(cached) = cached {
            return Ok(cached);
        }
        let raw = if offered.is_empty() {
            self.shared
                .deps
                .credentials
                .ice_servers(&self.shared.user)
                .await
                .map_err(|err| {
                    self.report(
                        SessionError::new(ErrorKind::IceServers, "ice_servers", "failed to fetch ice servers")
                            .with_cause(err),
                    )
                })?
        } else {
            offered
        };
        let servers = normalize_servers(&raw);
        self.shared.inner.lock().ice_servers = Some(servers.clone());
        Ok(servers)
    }

    async fn adopt_channel(&self, handle: Arc<dyn ChannelHandle>) {
        let channel = DataChannelSession::attach(handle, &self.shared.id, &self.shared.remote, self.shared.chunk);
        let watcher = tokio::spawn(announce_when_open(Arc::downgrade(&self.shared), channel.clone()));
        let rejected = {
            let mut inner = self.shared.inner.lock();
            if self.is_closed() {
                Some(watcher)
            } else {
                inner.channels.push(channel.clone());
                inner.watchers.push(watcher);
                None
            }
        };
        if let Some(watcher) = rejected {
            watcher.abort();
            channel.shutdown().await;
        }
    }

    async fn open_gate(&self) {
        let mut gate = self.shared.gate.lock().await;
        if self.is_closed() {
            return;
        }
        if self.advance(SessionPhase::Established) {
            info!(
                target = "peerline::session",
                session_id = %self.shared.id,
                remote = %self.shared.remote,
                "session established"
            );
            self.emit(SessionEvent::Established);
        }
        let ready = gate.open();
        debug!(
            target = "peerline::session",
            session_id = %self.shared.id,
            flushed = ready.len(),
            "candidate gate opened"
        );
        for candidate in ready {
            self.send_candidate(candidate).await;
        }
    }

    async fn on_local_candidate(&self, candidate: IceCandidate) {
        let filter = self.shared.inner.lock().filter;
        let Some(candidate) = filter.filter_candidate(&candidate) else {
            trace!(
                target = "peerline::session",
                session_id = %self.shared.id,
                candidate = %candidate.candidate,
                policy = %filter.policy(),
                "candidate dropped by policy"
            );
            return;
        };
        let mut gate = self.shared.gate.lock().await;
        if self.is_closed() {
            return;
        }
        for ready in gate.offer(candidate) {
            self.send_candidate(ready).await;
        }
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        match self
            .shared
            .deps
            .signaling
            .send_ice(&self.shared.remote, &self.shared.id, candidate.clone())
            .await
        {
            Ok(()) => {
                trace!(
                    target = "peerline::session",
                    session_id = %self.shared.id,
                    candidate = %candidate.candidate,
                    "candidate sent"
                );
                self.emit(SessionEvent::IceSent(candidate));
            }
            Err(err) => {
                self.signaling_failure("send_ice", err);
            }
        }
    }

    async fn on_platform_event(&self, event: PlatformEvent) {
        if self.is_closed() {
            trace!(target = "peerline::session", session_id = %self.shared.id, event = ?event, "ignoring platform event after close");
            return;
        }
        match event {
            PlatformEvent::IceCandidateFound(candidate) => self.on_local_candidate(candidate).await,
            PlatformEvent::SignalingStateChanged(state) => {
                debug!(target = "peerline::session", session_id = %self.shared.id, state = ?state, "signaling state changed");
                self.emit(SessionEvent::StateChanged(state));
            }
            PlatformEvent::IceConnectionStateChanged(state) => {
                debug!(target = "peerline::session", session_id = %self.shared.id, state = ?state, "ice connection state changed");
                self.emit(SessionEvent::IceStateChanged(state));
                self.on_ice_state(state);
            }
            PlatformEvent::StreamAdded(stream) => {
                self.shared.inner.lock().remote_streams.push(stream.clone());
                debug!(target = "peerline::session", session_id = %self.shared.id, stream = %stream.id, "remote stream added");
                self.emit(SessionEvent::RemoteStreamAdded(stream));
            }
            PlatformEvent::DataChannelCreated(handle) => {
                let name = handle.label();
                if self.channel(&name).is_some() {
                    warn!(
                        target = "peerline::session",
                        session_id = %self.shared.id,
                        channel = %name,
                        "closing remote channel with a duplicate name"
                    );
                    if let Err(err) = handle.close().await {
                        debug!(target = "peerline::session", session_id = %self.shared.id, channel = %name, error = %err, "duplicate channel close failed");
                    }
                    return;
                }
                debug!(target = "peerline::session", session_id = %self.shared.id, channel = %name, "remote channel announced");
                self.adopt_channel(handle).await;
            }
        }
    }

    fn on_ice_state(&self, state: IceConnectionState) {
        let mut inner = self.shared.inner.lock();
        match state {
            IceConnectionState::Disconnected => {
                let shared = Arc::downgrade(&self.shared);
                inner.debounce.arm(async move {
                    // Detached so cancelling the timer from inside close
                    // cannot interrupt the close itself.
                    tokio::spawn(async move {
                        if let Some(shared) = shared.upgrade() {
                            PeerSession { shared }
                                .close_internal(CloseReason::Disconnected, None)
                                .await;
                        }
                    });
                });
                debug!(
                    target = "peerline::session",
                    session_id = %self.shared.id,
                    grace_ms = inner.debounce.grace().as_millis() as u64,
                    "transport disconnected; close armed"
                );
            }
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if inner.debounce.cancel() {
                    debug!(
                        target = "peerline::session",
                        session_id = %self.shared.id,
                        "transport reconnected; close cancelled"
                    );
                }
            }
            IceConnectionState::New
            | IceConnectionState::Checking
            | IceConnectionState::Failed
            | IceConnectionState::Closed => {}
        }
    }

    async fn close_internal(&self, reason: CloseReason, data: Option<Value>) {
        let mut previous = SessionPhase::NotOpened;
        let began = self.shared.phase.send_if_modified(|phase| {
            if phase.is_closed() {
                return false;
            }
            previous = *phase;
            *phase = SessionPhase::Closing;
            true
        });
        if !began {
            trace!(target = "peerline::session", session_id = %self.shared.id, "close ignored; already closing");
            return;
        }
        info!(
            target = "peerline::session",
            session_id = %self.shared.id,
            remote = %self.shared.remote,
            reason = ?reason,
            "closing session"
        );

        if reason == CloseReason::Local && previous != SessionPhase::NotOpened {
            if let Err(err) = self
                .shared
                .deps
                .signaling
                .send_bye(&self.shared.remote, &self.shared.id, data)
                .await
            {
                debug!(target = "peerline::session", session_id = %self.shared.id, error = %err, "failed to deliver bye");
            }
        }

        let (transport, channels, watchers, event_loop) = {
            let mut inner = self.shared.inner.lock();
            inner.debounce.cancel();
            inner.remote_candidates.clear();
            (
                inner.transport.take(),
                std::mem::take(&mut inner.channels),
                std::mem::take(&mut inner.watchers),
                inner.event_loop.take(),
            )
        };
        for watcher in watchers {
            watcher.abort();
        }
        self.shared.gate.lock().await.clear();
        for channel in &channels {
            channel.shutdown().await;
        }
        if let Some(transport) = transport {
            if let Err(err) = transport.close().await {
                warn!(target = "peerline::session", session_id = %self.shared.id, error = %err, "platform close failed");
            }
        }

        self.shared.phase.send_replace(SessionPhase::Closed);
        self.emit(SessionEvent::Closed(reason));
        if let Some(task) = event_loop {
            task.abort();
        }
    }

    fn ensure_not_opened(&self, operation: &'static str) -> SessionResult<()> {
        match self.state() {
            SessionPhase::NotOpened => Ok(()),
            phase => Err(SessionError::invalid_state(
                operation,
                format!("only allowed before the session opens (session is {phase})"),
            )),
        }
    }

    fn advance(&self, next: SessionPhase) -> bool {
        self.shared.phase.send_if_modified(|phase| {
            if phase.is_closed() || !phase.can_advance_to(next) {
                return false;
            }
            *phase = next;
            true
        })
    }

    fn filtered(&self, description: SessionDescription) -> SessionDescription {
        let filter = self.shared.inner.lock().filter;
        SessionDescription {
            kind: description.kind,
            sdp: filter.filter_description(&description.sdp),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(event);
    }

    fn report(&self, err: SessionError) -> SessionError {
        warn!(
            target = "peerline::session",
            session_id = %self.shared.id,
            kind = %err.kind,
            error = %err,
            cause = err.cause.as_deref().unwrap_or(""),
            "session operation failed"
        );
        self.emit(SessionEvent::Error(err.clone()));
        err
    }

    fn platform_failure(&self, operation: &'static str, err: PlatformError) -> SessionError {
        self.report(SessionError::new(ErrorKind::Platform, operation, "platform operation failed").with_cause(err))
    }

    fn signaling_failure(&self, operation: &'static str, err: SignalingError) -> SessionError {
        self.report(
            SessionError::new(ErrorKind::Signaling, operation, "failed to deliver signaling message")
                .with_cause(err),
        )
    }
}

async fn run_platform_events(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<PlatformEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        PeerSession { shared }.on_platform_event(event).await;
    }
}

async fn announce_when_open(shared: Weak<Shared>, channel: DataChannelSession) {
    if channel.wait_for_state(ChannelState::Open).await != ChannelState::Open {
        return;
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let session = PeerSession { shared };
    if session.is_closed() {
        return;
    }
    info!(
        target = "peerline::session",
        session_id = %session.shared.id,
        channel = %channel.id(),
        "data channel open"
    );
    session.emit(SessionEvent::ChannelCreated(channel));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use crate::platform::mock::{MockChannel, MockPlatform, MockScript};
    use crate::platform::{MediaKind, MediaTrack};
    use crate::signaling::StaticIceServers;
    use serde_json::json;
    use async_trait::async_trait;
    use std::time::Duration;

    const HOST: &str = "candidate:1 1 udp 2122260223 192.168.1.10 54400 typ host";
    const SRFLX: &str = "candidate:2 1 udp 1686052607 5.6.7.8 54401 typ srflx raddr 192.168.1.10 rport 54400";
    const RELAY: &str = "candidate:3 1 udp 41885439 9.9.9.9 3478 typ relay raddr 5.6.7.8 rport 54401";

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<SignalMessage> {
            self.sent.lock().clone()
        }

        fn candidates(&self) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter_map(|message| match message {
                    SignalMessage::Ice { candidate } => Some(candidate.candidate),
                    _ => None,
                })
                .collect()
        }

        fn names(&self) -> Vec<&'static str> {
            self.sent().iter().map(SignalMessage::name).collect()
        }
    }

    #[async_trait]
    impl Signaling for Recorder {
        async fn send(
            &self,
            remote: &str,
            session_id: &str,
            message: SignalMessage,
        ) -> Result<(), SignalingError> {
            assert_eq!(remote, "bob");
            assert_eq!(session_id, "s-1");
            self.sent.lock().push(message);
            Ok(())
        }
    }

    fn script(lines: &[&str]) -> MockScript {
        MockScript {
            local_candidates: lines.iter().map(|line| IceCandidate::new(*line)).collect(),
            ..MockScript::default()
        }
    }

    fn session(platform: &MockPlatform, servers: Vec<IceServer>) -> (PeerSession, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let deps = SessionDeps {
            signaling: recorder.clone(),
            credentials: Arc::new(StaticIceServers::new(servers)),
            platform: Arc::new(platform.clone()),
        };
        let session = PeerSession::new(
            "s-1",
            "bob",
            UserContext::named("alice"),
            deps,
            SessionConfig::default(),
            ChunkConfig::default(),
        );
        (session, recorder)
    }

    fn answer() -> SignalMessage {
        SignalMessage::Answer(AnswerPayload {
            answer: SessionDescription::answer("v=0\r\n"),
            accept_data: None,
        })
    }

    /// Lets every runnable task finish; the paused clock only advances once
    /// the runtime is idle.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn registration_is_refused_after_open() {
        let platform = MockPlatform::new();
        let (session, _) = session(&platform, Vec::new());
        assert_eq!(
            session.register_data_channel(" ").unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        session.register_data_channel("chat").unwrap();
        assert_eq!(
            session.register_data_channel("chat").unwrap_err().kind,
            ErrorKind::InvalidState
        );

        session.open(OpenOptions::default()).await.unwrap();
        let err = session.register_data_channel("late").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        let stream = MediaStream {
            id: "cam".into(),
            tracks: Vec::new(),
        };
        assert_eq!(session.add_stream(stream).unwrap_err().kind, ErrorKind::InvalidState);
        assert!(session.local_streams().is_empty());
        assert_eq!(session.data_channels().len(), 1);
        assert_eq!(
            session.open(OpenOptions::default()).await.unwrap_err().kind,
            ErrorKind::InvalidState
        );
    }

    #[tokio::test(start_paused = true)]
    async fn candidates_wait_for_the_answer() {
        let platform = MockPlatform::new();
        platform.set_script(script(&[HOST, SRFLX]));
        let (session, recorder) = session(&platform, vec![IceServer::stun("stun:stun.example.org/")]);
        let mut events = session.subscribe();

        session.open(OpenOptions::default()).await.unwrap();
        settle().await;
        assert_eq!(session.state(), SessionPhase::Establishing);
        assert_eq!(recorder.names(), vec!["offer"]);
        assert_eq!(session.pending_candidates().await, 2);
        match &recorder.sent()[0] {
            SignalMessage::Offer(payload) => {
                assert_eq!(payload.connection_type, CandidatePolicy::Default);
                assert_eq!(payload.ice_servers, vec![IceServer::stun("stun:stun.example.org")]);
            }
            other => panic!("unexpected {other:?}"),
        }

        session.handle_signal(answer()).await.unwrap();
        assert_eq!(session.state(), SessionPhase::Established);
        assert_eq!(recorder.candidates(), vec![HOST.to_owned(), SRFLX.to_owned()]);
        assert_eq!(session.pending_candidates().await, 0);

        let peer = platform.last_peer().unwrap();
        peer.emit(PlatformEvent::IceCandidateFound(IceCandidate::new(RELAY)));
        settle().await;
        assert_eq!(recorder.candidates().last().map(String::as_str), Some(RELAY));

        let names: Vec<_> = drain(&mut events).iter().map(SessionEvent::name).collect();
        let position = |name| names.iter().position(|n| *n == name).unwrap();
        assert!(position("opening") < position("offer_sent"));
        assert!(position("offer_sent") < position("establishing"));
        assert!(position("answer_received") < position("established"));
        assert!(position("established") < position("ice_sent"));
    }

    #[tokio::test(start_paused = true)]
    async fn server_policy_rewrites_reflexive_candidates() {
        let platform = MockPlatform::new();
        platform.set_script(script(&[HOST, SRFLX, RELAY]));
        let servers = vec![IceServer::turn("turn:1.2.3.4:3478", "user", "secret")];
        let (session, recorder) = session(&platform, servers);

        session
            .open(OpenOptions {
                connection_type: Some(CandidatePolicy::Server),
                connection_data: None,
            })
            .await
            .unwrap();
        session.handle_signal(answer()).await.unwrap();
        settle().await;

        let sent = recorder.candidates();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains(" 1.2.3.4 54401 typ relay "));
        assert_eq!(sent[1], RELAY);

        let SignalMessage::Offer(offer) = &recorder.sent()[0] else {
            panic!("first message must be the offer");
        };
        assert_eq!(offer.connection_type, CandidatePolicy::Server);
        assert!(!offer.offer.sdp.contains("typ host"));
        assert!(!offer.offer.sdp.contains("typ srflx"));
        assert!(offer.offer.sdp.contains(RELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn offer_failure_leaves_session_opening() {
        let platform = MockPlatform::new();
        platform.set_script(MockScript {
            fail_offer: Some("no codecs".into()),
            ..MockScript::default()
        });
        let (session, recorder) = session(&platform, Vec::new());
        let mut events = session.subscribe();

        let err = session.open(OpenOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OfferCreationFailed);
        assert_eq!(err.cause.as_deref(), Some("platform rejected the operation: no codecs"));
        assert_eq!(session.state(), SessionPhase::Opening);
        assert!(recorder.sent().is_empty());
        assert!(drain(&mut events).iter().any(|event| matches!(
            event,
            SessionEvent::Error(err) if err.kind == ErrorKind::OfferCreationFailed
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_candidates_wait_for_remote_description() {
        let platform = MockPlatform::new();
        let (session, _) = session(&platform, Vec::new());
        session.open(OpenOptions::default()).await.unwrap();

        let early = IceCandidate::new(HOST);
        session
            .handle_signal(SignalMessage::Ice {
                candidate: early.clone(),
            })
            .await
            .unwrap();
        let peer = platform.last_peer().unwrap();
        assert!(peer.applied_candidates().is_empty());

        session.handle_signal(answer()).await.unwrap();
        assert_eq!(peer.applied_candidates(), vec![early]);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_creation_failure_is_reported() {
        let platform = MockPlatform::new();
        platform.set_script(MockScript {
            fail_channel: Some("sctp disabled".into()),
            ..MockScript::default()
        });
        let (session, _) = session(&platform, Vec::new());
        session
            .register_data_channel_with("chat", ChannelConfig::negotiated(3))
            .unwrap();
        let mut events = session.subscribe();
        session.open(OpenOptions::default()).await.unwrap();

        let failure = drain(&mut events).into_iter().find_map(|event| match event {
            SessionEvent::ChannelCreationFailed { name, config, error } => Some((name, config, error)),
            _ => None,
        });
        let (name, config, error) = failure.expect("creation failure event");
        assert_eq!(name, "chat");
        assert_eq!(config.negotiated_id, Some(3));
        assert_eq!(error.kind, ErrorKind::DataChannelCreationFailed);
        assert_eq!(session.state(), SessionPhase::Establishing);
        assert!(session.data_channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn bye_closes_without_replying() {
        let platform = MockPlatform::new();
        let (session, recorder) = session(&platform, Vec::new());
        session.open(OpenOptions::default()).await.unwrap();
        let mut events = session.subscribe();

        session
            .handle_signal(SignalMessage::Bye { data: None })
            .await
            .unwrap();
        assert_eq!(session.state(), SessionPhase::Closed);
        assert_eq!(session.signaling_state(), SignalingState::Closed);
        assert_eq!(recorder.names(), vec!["offer"]);
        assert_eq!(platform.last_peer().unwrap().close_calls(), 1);
        let closed: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::Closed(_)))
            .collect();
        assert!(matches!(closed.as_slice(), [SessionEvent::Closed(CloseReason::RemoteBye)]));
    }

    #[tokio::test(start_paused = true)]
    async fn double_close_emits_closed_once() {
        let platform = MockPlatform::new();
        let (session, recorder) = session(&platform, Vec::new());
        session.register_data_channel("chat").unwrap();
        session.open(OpenOptions::default()).await.unwrap();
        let mut events = session.subscribe();

        session.close(Some(serde_json::json!({"reason": "done"}))).await;
        session.close(None).await;

        let closed = drain(&mut events)
            .iter()
            .filter(|event| matches!(event, SessionEvent::Closed(_)))
            .count();
        assert_eq!(closed, 1);
        assert_eq!(recorder.names(), vec!["offer", "bye"]);
        let peer = platform.last_peer().unwrap();
        assert_eq!(peer.close_calls(), 1);
        assert!(session.data_channels().is_empty());

        // Late platform notifications are ignored.
        peer.emit(PlatformEvent::IceCandidateFound(IceCandidate::new(HOST)));
        settle().await;
        assert!(recorder.candidates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_keeps_session() {
        let platform = MockPlatform::new();
        let (session, _) = session(&platform, Vec::new());
        session.open(OpenOptions::default()).await.unwrap();
        session.handle_signal(answer()).await.unwrap();
        let peer = platform.last_peer().unwrap();

        peer.emit(PlatformEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        tokio::time::sleep(Duration::from_secs(5)).await;
        peer.emit(PlatformEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(session.state(), SessionPhase::Established);
        assert_eq!(peer.close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lasting_disconnect_closes_once() {
        let platform = MockPlatform::new();
        let (session, recorder) = session(&platform, Vec::new());
        session.open(OpenOptions::default()).await.unwrap();
        session.handle_signal(answer()).await.unwrap();
        let mut events = session.subscribe();
        let peer = platform.last_peer().unwrap();

        peer.emit(PlatformEvent::IceConnectionStateChanged(IceConnectionState::Disconnected));
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(session.state(), SessionPhase::Established);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(session.state(), SessionPhase::Closed);

        let closed: Vec<_> = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, SessionEvent::Closed(_)))
            .collect();
        assert!(matches!(closed.as_slice(), [SessionEvent::Closed(CloseReason::Disconnected)]));
        assert_eq!(peer.close_calls(), 1);
        assert!(!recorder.names().contains(&"bye"));
    }

    #[tokio::test(start_paused = true)]
    async fn streams_added_before_open_reach_the_platform() {
        let platform = MockPlatform::new();
        let (session, _) = session(&platform, Vec::new());
        let mut events = session.subscribe();
        let camera = MediaStream {
            id: "cam".into(),
            tracks: vec![MediaTrack {
                id: "v0".into(),
                kind: MediaKind::Video,
            }],
        };
        session.add_stream(camera.clone()).unwrap();
        assert_eq!(session.local_streams(), vec![camera.clone()]);

        session.open(OpenOptions::default()).await.unwrap();
        let peer = platform.last_peer().unwrap();
        assert_eq!(peer.streams(), vec![camera]);

        let microphone = MediaStream {
            id: "mic".into(),
            tracks: vec![MediaTrack {
                id: "a0".into(),
                kind: MediaKind::Audio,
            }],
        };
        peer.emit(PlatformEvent::StreamAdded(microphone.clone()));
        settle().await;
        assert_eq!(session.remote_streams(), vec![microphone]);

        let names: Vec<_> = drain(&mut events).iter().map(SessionEvent::name).collect();
        assert_eq!(names.first(), Some(&"local_stream_added"));
        assert!(names.contains(&"remote_stream_added"));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_errors_do_not_close_the_session() {
        let platform = MockPlatform::new();
        let (session, recorder) = session(&platform, Vec::new());
        session.register_data_channel("chat").unwrap();
        session.open(OpenOptions::default()).await.unwrap();
        session.handle_signal(answer()).await.unwrap();
        let chat = session.channel("chat").expect("chat channel");
        let mut channel_events = chat.subscribe();

        let mock = platform.last_peer().unwrap().channel("chat").unwrap();
        mock.inject_error("sctp abort");
        settle().await;

        let error = std::iter::from_fn(|| channel_events.try_recv().ok())
            .find_map(|event| match event {
                ChannelEvent::Error(err) => Some(err),
                _ => None,
            })
            .expect("channel error event");
        assert_eq!(error.kind, ErrorKind::ChannelError);
        assert_eq!(error.cause.as_deref(), Some("sctp abort"));
        assert_eq!(session.state(), SessionPhase::Established);
        assert_eq!(session.data_channels().len(), 1);
        assert_eq!(mock.close_calls(), 0);
        assert!(!recorder.names().contains(&"bye"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_remote_channel_is_closed() {
        let platform = MockPlatform::new();
        let (session, _) = session(&platform, Vec::new());
        session.register_data_channel("chat").unwrap();
        session.open(OpenOptions::default()).await.unwrap();
        let peer = platform.last_peer().unwrap();

        let duplicate = MockChannel::new("chat", ChannelState::Connecting);
        peer.emit(PlatformEvent::DataChannelCreated(duplicate.clone()));
        settle().await;

        assert_eq!(duplicate.close_calls(), 1);
        assert_eq!(session.data_channels().len(), 1);
        assert_eq!(peer.channel("chat").unwrap().close_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_data_rides_on_the_answer() {
        let platform = MockPlatform::new();
        let (session, recorder) = session(&platform, Vec::new());
        session.set_accept_data(json!({"seat": 4}));

        session
            .handle_signal(SignalMessage::Offer(OfferPayload {
                offer: SessionDescription::offer("v=0\r\n"),
                connection_type: CandidatePolicy::Direct,
                ice_servers: Vec::new(),
                connection_data: Some(json!({"room": "r1"})),
            }))
            .await
            .unwrap();

        assert_eq!(session.role(), Some(Role::Responder));
        assert_eq!(session.connection_type(), CandidatePolicy::Direct);
        assert_eq!(session.state(), SessionPhase::Established);
        match recorder.sent().as_slice() {
            [SignalMessage::Answer(payload)] => {
                assert_eq!(payload.accept_data, Some(json!({"seat": 4})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
