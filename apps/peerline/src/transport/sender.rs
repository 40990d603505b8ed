use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::platform::{ChannelHandle, PlatformError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained { sent: usize },
    /// The channel went away; the queued frames were discarded.
    Abandoned {
        sent: usize,
        dropped: usize,
        cause: PlatformError,
    },
}

/// FIFO of encoded frames waiting for the channel. The head is retried
/// after `backoff` whenever the channel refuses it, so frames leave in
/// exactly the order they were enqueued.
#[derive(Debug)]
pub struct RetryBuffer {
    queue: VecDeque<Bytes>,
    backoff: Duration,
}

impl RetryBuffer {
    pub fn new(backoff: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            backoff,
        }
    }

    pub fn enqueue<I>(&mut self, frames: I)
    where
        I: IntoIterator<Item = Bytes>,
    {
        self.queue.extend(frames);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub async fn drain(&mut self, channel: &dyn ChannelHandle) -> DrainOutcome {
        let mut sent = 0;
        let mut attempts: u32 = 0;
        while let Some(head) = self.queue.front().cloned() {
            match channel.send(head).await {
                Ok(()) => {
                    self.queue.pop_front();
                    sent += 1;
                    attempts = 0;
                }
                Err(err) if err == PlatformError::Closed || channel.state().is_terminal() => {
                    let dropped = self.queue.len();
                    self.queue.clear();
                    debug!(
                        target = "peerline::transport::sender",
                        channel = %channel.label(),
                        dropped,
                        error = %err,
                        "channel gone; abandoning queued frames"
                    );
                    return DrainOutcome::Abandoned {
                        sent,
                        dropped,
                        cause: err,
                    };
                }
                Err(err) => {
                    attempts = attempts.saturating_add(1);
                    trace!(
                        target = "peerline::transport::sender",
                        channel = %channel.label(),
                        queued = self.queue.len(),
                        attempts,
                        error = %err,
                        "channel refused frame; retrying after backoff"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
        DrainOutcome::Drained { sent }
    }
}
