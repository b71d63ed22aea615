//! Single-flight background job with a non-blocking poll.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Outcome of [`InFlight::poll`].
#[derive(Debug, PartialEq, Eq)]
pub enum PollResult<T> {
    /// No job was started.
    Idle,
    /// The job is still running.
    Pending,
    /// The job finished and produced a value. The slot is free again.
    Ready(T),
    /// The job ended without producing a value (panicked or was aborted).
    /// The slot is free again.
    Abandoned,
}

/// At most one running job at a time; the result is delivered exactly once.
pub struct InFlight<T> {
    rx: Option<oneshot::Receiver<T>>,
    handle: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            rx: None,
            handle: None,
            started_at: None,
        }
    }
}

impl<T: Send + 'static> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.rx.is_some()
    }

    /// When the running job was started.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Spawn `job` unless one is already pending. Returns whether it was spawned.
    pub fn start<F>(&mut self, job: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.is_pending() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let out = job.await;
            let _ = tx.send(out);
        });
        self.rx = Some(rx);
        self.handle = Some(handle);
        self.started_at = Some(Instant::now());
        true
    }

    /// Wait up to `timeout` for the pending job.
    pub async fn poll(&mut self, timeout: Duration) -> PollResult<T> {
        let Some(rx) = self.rx.as_mut() else {
            return PollResult::Idle;
        };
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => PollResult::Pending,
            Ok(Ok(value)) => {
                self.clear();
                PollResult::Ready(value)
            }
            Ok(Err(_)) => {
                self.clear();
                PollResult::Abandoned
            }
        }
    }

    /// Abort the running job, if any, and free the slot.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.rx = None;
        self.handle = None;
        self.started_at = None;
    }
}

impl<T> Drop for InFlight<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
