use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// One pending "close after grace" timer. Re-arming or cancelling aborts
/// the previous timer.
#[derive(Debug)]
pub struct DisconnectDebounce {
    grace: Duration,
    pending: Option<JoinHandle<()>>,
}

impl DisconnectDebounce {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: None,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn is_armed(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Runs `on_expire` once `grace` elapses unless cancelled first.
    pub fn arm<F>(&mut self, on_expire: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let grace = self.grace;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            on_expire.await;
        }));
    }

    /// Returns whether a live timer was cancelled.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }
}

impl Drop for DisconnectDebounce {
    fn drop(&mut self) {
        self.cancel();
    }
}
