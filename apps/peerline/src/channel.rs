use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{ErrorKind, SessionError, SessionResult};
use crate::platform::{ChannelHandle, ChannelNotification, ChannelState};
use crate::telemetry::frame_preview;
use crate::transport::chunk::{self, ChunkConfig, DroppedSet, Reassembler};
use crate::transport::codec;
use crate::transport::sender::{DrainOutcome, RetryBuffer};

const EVENT_CAPACITY: usize = 256;
const PREVIEW_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Closed,
    MessageSent { bytes: usize, fragments: usize },
    MessageReceived(Value),
    Error(SessionError),
    /// Frames queued for a channel that closed underneath them.
    SendFailed(SessionError),
    FragmentSetDropped(DroppedSet),
}

/// A named data channel inside a peer session. Outbound values go through
/// serialize → fragment → frame → retry buffer; inbound frames are
/// reassembled and deserialized before they surface as events.
#[derive(Clone)]
pub struct DataChannelSession {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    name: String,
    id: String,
    remote: String,
    handle: Arc<dyn ChannelHandle>,
    config: ChunkConfig,
    state: watch::Sender<ChannelState>,
    outbound: mpsc::UnboundedSender<Vec<Bytes>>,
    reassembler: Mutex<Reassembler>,
    events: broadcast::Sender<ChannelEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for DataChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannelSession")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl DataChannelSession {
    /// Wraps a platform channel and starts its sender and notification tasks.
    pub fn attach(
        handle: Arc<dyn ChannelHandle>,
        session_id: &str,
        remote: &str,
        config: ChunkConfig,
    ) -> Self {
        let name = handle.label();
        let (state, _) = watch::channel(handle.state());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            id: format!("{session_id}{name}"),
            name,
            remote: remote.to_owned(),
            handle: Arc::clone(&handle),
            config,
            state,
            outbound,
            reassembler: Mutex::new(Reassembler::new(config)),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        let sender = tokio::spawn(run_sender(
            Arc::downgrade(&inner),
            Arc::clone(&handle),
            config,
            outbound_rx,
        ));
        let notifications = tokio::spawn(run_notifications(Arc::downgrade(&inner), notify_rx));
        inner.tasks.lock().extend([sender, notifications]);
        handle.bind(notify_tx);

        debug!(
            target = "peerline::channel",
            channel = %inner.id,
            remote = %inner.remote,
            "data channel attached"
        );
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the channel reaches `target`, or `Closed` if it closes first.
    pub async fn wait_for_state(&self, target: ChannelState) -> ChannelState {
        let mut rx = self.inner.state.subscribe();
        match rx
            .wait_for(|state| *state == target || *state == ChannelState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => ChannelState::Closed,
        }
    }

    pub fn send<T: Serialize + ?Sized>(&self, value: &T) -> SessionResult<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(self.fail(SessionError::invalid_state(
                "send",
                format!("channel {} is {state:?}", self.inner.name),
            )));
        }

        let payload = codec::encode_message(value).map_err(|err| {
            self.fail(
                SessionError::new(ErrorKind::SendFailed, "send", "failed to serialize message")
                    .with_cause(err),
            )
        })?;
        let limit = self.inner.config.max_message_bytes;
        if payload.len() > limit {
            return Err(self.fail(SessionError::new(
                ErrorKind::SendFailed,
                "send",
                format!("message of {} bytes exceeds the {limit} byte limit", payload.len()),
            )));
        }

        let set_id = chunk::new_set_id();
        let fragments = chunk::split_message(&payload, set_id, &self.inner.config).map_err(|err| {
            self.fail(
                SessionError::new(ErrorKind::SendFailed, "send", "failed to fragment message")
                    .with_cause(err),
            )
        })?;
        let frames: Vec<Bytes> = fragments.iter().map(chunk::encode_frame).collect();
        let count = frames.len();

        self.inner.outbound.send(frames).map_err(|_| {
            self.fail(SessionError::new(
                ErrorKind::SendFailed,
                "send",
                "channel sender has stopped",
            ))
        })?;

        trace!(
            target = "peerline::channel",
            channel = %self.inner.id,
            set_id,
            bytes = payload.len(),
            fragments = count,
            "message queued"
        );
        self.emit(ChannelEvent::MessageSent {
            bytes: payload.len(),
            fragments: count,
        });
        Ok(())
    }

    pub async fn close(&self) -> SessionResult<()> {
        let began = self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = ChannelState::Closing;
                true
            }
        });
        if !began {
            return Ok(());
        }
        self.inner.handle.close().await.map_err(|err| {
            self.fail(
                SessionError::new(ErrorKind::ChannelError, "close", "platform refused to close channel")
                    .with_cause(err),
            )
        })
    }

    /// Closes the platform channel and stops this channel's tasks. Used when
    /// the owning session is torn down.
    pub(crate) async fn shutdown(&self) {
        if let Err(err) = self.close().await {
            debug!(target = "peerline::channel", channel = %self.inner.id, error = %err, "close during shutdown failed");
        }
        self.transition(ChannelState::Closed);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.inner.events.send(event);
    }

    fn fail(&self, err: SessionError) -> SessionError {
        warn!(
            target = "peerline::channel",
            channel = %self.inner.id,
            kind = %err.kind,
            error = %err,
            "channel operation failed"
        );
        self.emit(ChannelEvent::Error(err.clone()));
        err
    }

    fn transition(&self, next: ChannelState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == next || *state == ChannelState::Closed {
                return false;
            }
            *state = next;
            true
        });
        if !changed {
            return;
        }
        debug!(target = "peerline::channel", channel = %self.inner.id, state = ?next, "channel state changed");
        match next {
            ChannelState::Open => self.emit(ChannelEvent::Open),
            ChannelState::Closed => self.emit(ChannelEvent::Closed),
            ChannelState::Connecting | ChannelState::Closing => {}
        }
    }

    fn on_notification(&self, notification: ChannelNotification) {
        match notification {
            ChannelNotification::StateChanged(state) => self.transition(state),
            ChannelNotification::Message(frame) => self.on_frame(&frame),
            ChannelNotification::Error(cause) => {
                self.fail(
                    SessionError::new(ErrorKind::ChannelError, "receive", "channel reported an error")
                        .with_cause(cause),
                );
            }
        }
    }

    fn on_frame(&self, raw: &[u8]) {
        let now = Instant::now();
        let fragment = match chunk::decode_frame(raw, &self.inner.config) {
            Ok(fragment) => fragment,
            Err(err) => {
                trace!(
                    target = "peerline::channel",
                    channel = %self.inner.id,
                    head = %frame_preview(raw, PREVIEW_BYTES),
                    "malformed frame"
                );
                self.fail(
                    SessionError::new(ErrorKind::ChannelError, "receive", "discarded malformed frame")
                        .with_cause(err),
                );
                return;
            }
        };
        trace!(
            target = "peerline::channel",
            channel = %self.inner.id,
            set_id = fragment.set_id,
            index = fragment.index,
            total = fragment.total,
            "fragment received"
        );

        let (result, mut dropped) = {
            let mut reassembler = self.inner.reassembler.lock();
            let dropped = reassembler.gc(now);
            (reassembler.ingest(fragment, now), dropped)
        };
        let completed = match result {
            Ok(mut outcome) => {
                dropped.append(&mut outcome.dropped);
                outcome.completed
            }
            Err(err) => {
                self.fail(
                    SessionError::new(ErrorKind::ChannelError, "receive", "discarded inconsistent fragment")
                        .with_cause(err),
                );
                None
            }
        };

        for set in dropped {
            debug!(
                target = "peerline::channel",
                channel = %self.inner.id,
                set_id = set.set_id,
                reason = ?set.reason,
                received = set.received,
                total = set.total,
                "dropped incomplete fragment set"
            );
            self.emit(ChannelEvent::FragmentSetDropped(set));
        }

        if let Some(payload) = completed {
            match codec::decode_message(&payload) {
                Ok(value) => self.emit(ChannelEvent::MessageReceived(value)),
                Err(err) => {
                    self.fail(
                        SessionError::new(ErrorKind::ChannelError, "receive", "failed to deserialize message")
                            .with_cause(err),
                    );
                }
            }
        }
    }
}

async fn run_notifications(
    inner: Weak<ChannelInner>,
    mut rx: mpsc::UnboundedReceiver<ChannelNotification>,
) {
    while let Some(notification) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        DataChannelSession { inner }.on_notification(notification);
    }
}

async fn run_sender(
    inner: Weak<ChannelInner>,
    handle: Arc<dyn ChannelHandle>,
    config: ChunkConfig,
    mut rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
) {
    let mut buffer = RetryBuffer::new(config.retry_backoff);
    while let Some(frames) = rx.recv().await {
        buffer.enqueue(frames);
        while let Ok(more) = rx.try_recv() {
            buffer.enqueue(more);
        }
        if let DrainOutcome::Abandoned { dropped, cause, .. } = buffer.drain(handle.as_ref()).await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let channel = DataChannelSession { inner };
            let err = SessionError::new(
                ErrorKind::SendFailed,
                "send",
                format!("channel closed with {dropped} frames still queued"),
            )
            .with_cause(cause);
            warn!(target = "peerline::channel", channel = %channel.id(), dropped, "abandoned queued frames");
            channel.emit(ChannelEvent::SendFailed(err));
        }
    }
}
