//! Cancellation and deadline propagation for lifecycle operations
//!
//! Every `Deploy`/`Wait`/`Destroy`/`WaitCleanup` call takes an
//! [`OperationContext`]. Cancelling a context (or letting its deadline pass)
//! aborts every poll that was started from it or from one of its children.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::retry::RetryCause;

/// Caller-supplied cancellation signal with an optional deadline
#[derive(Clone, Debug)]
pub struct OperationContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OperationContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing cancellation token (e.g. the operator's shutdown token)
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that additionally expires after `timeout`.
    ///
    /// The child keeps the earlier of the two deadlines and is cancelled
    /// whenever the parent is.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all contexts derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The point in time after which this context is expired, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Why this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<RetryCause> {
        if self.token.is_cancelled() {
            return Some(RetryCause::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(RetryCause::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline has passed
    pub async fn done(&self) -> RetryCause {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => RetryCause::Canceled,
                    _ = tokio::time::sleep_until(deadline) => RetryCause::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                RetryCause::Canceled
            }
        }
    }
}
