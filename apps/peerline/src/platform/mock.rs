//! Scripted in-process platform. Two platforms built with
//! [`MockPlatform::pair`] share a network: once both peers hold a local and
//! a remote description they report ICE connected, announce each other's
//! streams and in-band channels, and open linked channel ends that carry
//! frames to one another.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    ChannelConfig, ChannelHandle, ChannelNotification, ChannelState, IceConnectionState,
    MediaStream, PeerTransport, PlatformError, PlatformEvent, PlatformFactory, SdpKind,
    SessionDescription, SignalingState,
};
use crate::ice::{IceCandidate, IceServer};

pub struct MockChannel {
    label: String,
    negotiated_id: Option<u16>,
    state: Mutex<ChannelState>,
    sink: Mutex<Option<mpsc::UnboundedSender<ChannelNotification>>>,
    backlog: Mutex<Vec<ChannelNotification>>,
    peer: Mutex<Weak<MockChannel>>,
    sent: Mutex<Vec<Bytes>>,
    refusals: AtomicUsize,
    close_calls: AtomicUsize,
}

impl MockChannel {
    pub fn new(label: &str, state: ChannelState) -> Arc<Self> {
        Self::with_negotiated_id(label, None, state)
    }

    /// Two connecting ends wired to each other.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let left = Self::new(label, ChannelState::Connecting);
        let right = Self::new(label, ChannelState::Connecting);
        Self::link(&left, &right);
        (left, right)
    }

    fn with_negotiated_id(label: &str, negotiated_id: Option<u16>, state: ChannelState) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            negotiated_id,
            state: Mutex::new(state),
            sink: Mutex::new(None),
            backlog: Mutex::new(Vec::new()),
            peer: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            refusals: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
        })
    }

    fn notify(&self, notification: ChannelNotification) {
        let sink = self.sink.lock();
        match sink.as_ref() {
            Some(tx) => {
                let _ = tx.send(notification);
            }
            None => self.backlog.lock().push(notification),
        }
    }

    fn set_state(&self, next: ChannelState) -> bool {
        let mut state = self.state.lock();
        if *state == next {
            return false;
        }
        *state = next;
        true
    }

    fn is_linked(&self) -> bool {
        self.peer.lock().upgrade().is_some()
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    pub fn open(&self) {
        if self.set_state(ChannelState::Open) {
            self.notify(ChannelNotification::StateChanged(ChannelState::Open));
        }
    }

    /// The next `count` sends fail with `WouldBlock`.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Simulates a frame arriving from the far end.
    pub fn deliver(&self, frame: Bytes) {
        self.notify(ChannelNotification::Message(frame));
    }

    pub fn inject_error(&self, message: &str) {
        self.notify(ChannelNotification::Error(message.to_owned()));
    }

    /// Simulates the far end closing the channel.
    pub fn remote_close(&self) {
        if self.set_state(ChannelState::Closed) {
            self.notify(ChannelNotification::StateChanged(ChannelState::Closed));
        }
    }
}

#[async_trait]
impl ChannelHandle for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    fn bind(&self, notifications: mpsc::UnboundedSender<ChannelNotification>) {
        let mut sink = self.sink.lock();
        for pending in self.backlog.lock().drain(..) {
            let _ = notifications.send(pending);
        }
        *sink = Some(notifications);
    }

    async fn send(&self, frame: Bytes) -> Result<(), PlatformError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Connecting => return Err(PlatformError::WouldBlock),
            ChannelState::Closing | ChannelState::Closed => return Err(PlatformError::Closed),
        }
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(PlatformError::WouldBlock);
        }
        self.sent.lock().push(frame.clone());
        let peer = self.peer.lock().upgrade();
        if let Some(peer) = peer {
            peer.deliver(frame);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PlatformError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.set_state(ChannelState::Closed) {
            self.notify(ChannelNotification::StateChanged(ChannelState::Closed));
            let peer = self.peer.lock().upgrade();
            if let Some(peer) = peer {
                peer.remote_close();
            }
        }
        Ok(())
    }
}

/// Failure injection and candidate script for every peer a platform creates.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub local_candidates: Vec<IceCandidate>,
    pub fail_create: Option<String>,
    pub fail_offer: Option<String>,
    pub fail_answer: Option<String>,
    pub fail_channel: Option<String>,
}

#[derive(Default)]
struct Network {
    peers: Mutex<[Weak<MockPeer>; 2]>,
}

impl Network {
    fn install(&self, side: usize, peer: &Arc<MockPeer>) {
        self.peers.lock()[side] = Arc::downgrade(peer);
    }

    fn counterpart(&self, side: usize) -> Option<Arc<MockPeer>> {
        self.peers.lock()[1 - side].upgrade()
    }

    fn try_connect(&self, me: &Arc<MockPeer>) {
        let Some(other) = self.counterpart(me.side) else {
            return;
        };
        if !me.is_ready() || !other.is_ready() || !me.mark_connected() {
            return;
        }
        other.mark_connected();
        for peer in [me, &other] {
            peer.emit(PlatformEvent::IceConnectionStateChanged(IceConnectionState::Checking));
            peer.emit(PlatformEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
        MockPeer::exchange(me, &other);
        MockPeer::exchange(&other, me);
    }

    fn attach_channel(&self, me: &Arc<MockPeer>, channel: &Arc<MockChannel>) {
        if !me.is_connected() {
            return;
        }
        if let Some(other) = self.counterpart(me.side) {
            MockPeer::link_channel(&other, channel);
        }
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    signaling: SignalingState,
    applied: Vec<IceCandidate>,
    streams: Vec<MediaStream>,
    channels: Vec<Arc<MockChannel>>,
    connected: bool,
    closed: bool,
    close_calls: usize,
}

pub struct MockPeer {
    side: usize,
    network: Arc<Network>,
    events: mpsc::UnboundedSender<PlatformEvent>,
    script: MockScript,
    ice_servers: Vec<IceServer>,
    state: Mutex<PeerState>,
    me: Weak<MockPeer>,
}

impl MockPeer {
    /// Pushes a platform notification to the owning session.
    pub fn emit(&self, event: PlatformEvent) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn streams(&self) -> Vec<MediaStream> {
        self.state.lock().streams.clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.state.lock().channels.clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.local.is_some() && state.remote.is_some() && !state.closed
    }

    fn mark_connected(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.connected, true)
    }

    fn ensure_open(&self) -> Result<(), PlatformError> {
        if self.state.lock().closed {
            Err(PlatformError::Closed)
        } else {
            Ok(())
        }
    }

    fn render_sdp(&self, kind: &str) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns={kind}\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n",
            self.side + 1
        );
        for candidate in &self.script.local_candidates {
            sdp.push_str("a=");
            sdp.push_str(&candidate.candidate);
            sdp.push_str("\r\n");
        }
        sdp
    }

    fn exchange(from: &Arc<MockPeer>, to: &Arc<MockPeer>) {
        let (streams, channels) = {
            let state = from.state.lock();
            (state.streams.clone(), state.channels.clone())
        };
        for stream in streams {
            to.emit(PlatformEvent::StreamAdded(stream));
        }
        for channel in channels {
            Self::link_channel(to, &channel);
        }
    }

    /// Connects `channel` to a matching end on `to`: a channel with the same
    /// negotiated id when there is one, otherwise a freshly announced end.
    fn link_channel(to: &Arc<MockPeer>, channel: &Arc<MockChannel>) {
        if channel.is_linked() || channel.state().is_terminal() {
            return;
        }
        let remote = match channel.negotiated_id {
            Some(id) => {
                let found = to
                    .state
                    .lock()
                    .channels
                    .iter()
                    .find(|c| c.negotiated_id == Some(id) && !c.is_linked())
                    .cloned();
                match found {
                    Some(found) => found,
                    None => return,
                }
            }
            None => {
                let remote = MockChannel::with_negotiated_id(&channel.label, None, ChannelState::Connecting);
                to.state.lock().channels.push(Arc::clone(&remote));
                to.emit(PlatformEvent::DataChannelCreated(remote.clone()));
                remote
            }
        };
        MockChannel::link(channel, &remote);
        channel.open();
        remote.open();
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PlatformError> {
        self.ensure_open()?;
        if let Some(reason) = &self.script.fail_offer {
            return Err(PlatformError::Rejected(reason.clone()));
        }
        Ok(SessionDescription::offer(self.render_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError> {
        self.ensure_open()?;
        if let Some(reason) = &self.script.fail_answer {
            return Err(PlatformError::Rejected(reason.clone()));
        }
        if self.state.lock().remote.is_none() {
            return Err(PlatformError::Rejected("no remote offer".into()));
        }
        Ok(SessionDescription::answer(self.render_sdp("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let signaling = {
            let mut state = self.state.lock();
            state.signaling = match desc.kind {
                SdpKind::Offer => SignalingState::HaveLocalOffer,
                SdpKind::Pranswer => SignalingState::HaveLocalPranswer,
                SdpKind::Answer | SdpKind::Rollback => SignalingState::Stable,
            };
            state.local = Some(desc);
            state.signaling
        };
        self.emit(PlatformEvent::SignalingStateChanged(signaling));
        for candidate in &self.script.local_candidates {
            self.emit(PlatformEvent::IceCandidateFound(candidate.clone()));
        }
        if let Some(me) = self.me.upgrade() {
            self.network.try_connect(&me);
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let signaling = {
            let mut state = self.state.lock();
            state.signaling = match desc.kind {
                SdpKind::Offer => SignalingState::HaveRemoteOffer,
                SdpKind::Pranswer => SignalingState::HaveRemotePranswer,
                SdpKind::Answer | SdpKind::Rollback => SignalingState::Stable,
            };
            state.remote = Some(desc);
            state.signaling
        };
        self.emit(PlatformEvent::SignalingStateChanged(signaling));
        if let Some(me) = self.me.upgrade() {
            self.network.try_connect(&me);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PlatformError::Rejected("remote description not set".into()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), PlatformError> {
        self.ensure_open()?;
        self.state.lock().streams.push(stream.clone());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        config: &ChannelConfig,
    ) -> Result<Arc<dyn ChannelHandle>, PlatformError> {
        self.ensure_open()?;
        if let Some(reason) = &self.script.fail_channel {
            return Err(PlatformError::Unsupported(reason.clone()));
        }
        let channel = MockChannel::with_negotiated_id(label, config.negotiated_id, ChannelState::Connecting);
        self.state.lock().channels.push(Arc::clone(&channel));
        if let Some(me) = self.me.upgrade() {
            self.network.attach_channel(&me, &channel);
        }
        Ok(channel)
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn close(&self) -> Result<(), PlatformError> {
        let channels = {
            let mut state = self.state.lock();
            state.close_calls += 1;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.signaling = SignalingState::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            let _ = channel.close().await;
        }
        Ok(())
    }
}

/// Factory handing out [`MockPeer`]s; keeps every peer it built so tests
/// can reach them.
#[derive(Clone)]
pub struct MockPlatform {
    side: usize,
    network: Arc<Network>,
    script: Arc<Mutex<MockScript>>,
    created: Arc<Mutex<Vec<Arc<MockPeer>>>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::on_network(0, Arc::new(Network::default()))
    }

    /// Two platforms whose peers connect to each other.
    pub fn pair() -> (Self, Self) {
        let network = Arc::new(Network::default());
        (
            Self::on_network(0, Arc::clone(&network)),
            Self::on_network(1, network),
        )
    }

    fn on_network(side: usize, network: Arc<Network>) -> Self {
        Self {
            side,
            network,
            script: Arc::new(Mutex::new(MockScript::default())),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_script(&self, script: MockScript) {
        *self.script.lock() = script;
    }

    pub fn last_peer(&self) -> Option<Arc<MockPeer>> {
        self.created.lock().last().cloned()
    }

    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl PlatformFactory for MockPlatform {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PlatformEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PlatformError> {
        let script = self.script.lock().clone();
        if let Some(reason) = &script.fail_create {
            return Err(PlatformError::Rejected(reason.clone()));
        }
        let peer = Arc::new_cyclic(|me| MockPeer {
            side: self.side,
            network: Arc::clone(&self.network),
            events,
            script,
            ice_servers: ice_servers.to_vec(),
            state: Mutex::new(PeerState::default()),
            me: me.clone(),
        });
        self.network.install(self.side, &peer);
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}
