//! Cooperative control signals shared between the queue and a run driver.
//!
//! The queue flips these; the driver only observes them at step boundaries and
//! while blocked on a confirmation, never in the middle of a tool call.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a driver stopped before finishing its test cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    deadline: Option<Instant>,
}

impl RunControl {
    pub fn new(deadline: Option<Instant>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
            deadline,
        }
    }

    /// A control that starts out paused (used when re-attaching a PAUSED run).
    pub fn paused(deadline: Option<Instant>) -> Self {
        let control = Self::new(deadline);
        control.pause();
        control
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check for a stop condition.
    pub fn check(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(StopReason::TimedOut),
            _ => None,
        }
    }

    /// Step-boundary checkpoint: returns immediately unless paused, in which
    /// case it waits for resume, cancellation, or the deadline.
    pub async fn checkpoint(&self) -> Result<(), StopReason> {
        loop {
            if let Some(reason) = self.check() {
                return Err(reason);
            }
            if !self.is_paused() {
                return Ok(());
            }

            let mut rx = self.paused.subscribe();
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = until(self.deadline) => {}
                _ = rx.wait_for(|paused| !*paused) => {}
            }
        }
    }

    /// Resolves once the run is cancelled or its deadline passes.
    pub async fn stopped(&self) -> StopReason {
        tokio::select! {
            _ = self.cancel.cancelled() => StopReason::Cancelled,
            _ = until(self.deadline) => StopReason::TimedOut,
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
