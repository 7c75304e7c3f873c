//! Cancellation and deadline propagation for one transfer.
//!
//! A [`TransferContext`] is a [`CancellationToken`] plus an optional deadline.
//! A timeout is just cancellation triggered by the deadline: both surface
//! through [`TransferContext::done`].

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::TransferError;

/// Governs the lifetime of a transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl TransferContext {
    /// A context that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing token (e.g. a server's shutdown token).
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Returns a child context that additionally expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a child context that additionally expires at `deadline`.
    ///
    /// The earlier of the parent's and the new deadline wins.
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

    /// Returns a child context: cancelling the parent cancels the child, not
    /// the other way around.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Non-blocking check: the error the context has ended with, if any.
    ///
    /// Explicit cancellation takes precedence over an expired deadline.
    pub fn check(&self) -> Result<(), TransferError> {
        if self.token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TransferError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves once the context ends, with the reason it ended.
    pub async fn done(&self) -> TransferError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => TransferError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => TransferError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                TransferError::Cancelled
            }
        }
    }
}
