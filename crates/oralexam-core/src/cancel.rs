//! Caller-side cancellation for in-flight model calls.
//!
//! A `CancelToken` combines an explicit cancel signal (fired through a
//! `CancelHandle`) with an optional deadline. The gateway races every
//! attempt and every backoff sleep against `CancelToken::cancelled`.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::CancelReason;

/// Fires cancellation for every token cloned from its pair.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with no receivers left.
        self.tx.send_replace(true);
    }
}

/// Observes cancellation and an optional deadline.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

/// Create a linked handle/token pair.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx, deadline: None })
}

impl CancelToken {
    /// A token that is never cancelled (unless given a deadline).
    pub fn never() -> Self {
        let (_handle, token) = cancel_pair();
        token
    }

    /// Also cancel once `timeout` has elapsed from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Also cancel at `deadline`; keeps the earlier of two deadlines.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Non-blocking check.
    pub fn check(&self) -> Option<CancelReason> {
        if *self.rx.borrow() {
            return Some(CancelReason::Requested);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.rx.clone();
        let signal = async move {
            loop {
                if *rx.borrow_and_update() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling: the signal can never fire.
                    std::future::pending::<()>().await;
                }
            }
        };

        match self.deadline {
            Some(deadline) => tokio::select! {
                () = signal => CancelReason::Requested,
                () = tokio::time::sleep_until(deadline) => CancelReason::DeadlineExceeded,
            },
            None => {
                signal.await;
                CancelReason::Requested
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
