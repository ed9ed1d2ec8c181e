//! Cooperative cancellation for a single archive run.

use crate::utils::errors::{BackupError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline for one run
#[derive(Debug, Clone)]
pub struct RunControl {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunControl {
    /// A timeout too large to represent as an instant means no deadline.
    pub fn new(token: CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token,
            deadline: timeout.and_then(|t| Instant::now().checked_add(t)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail with `Cancelled` if the run should stop
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(BackupError::Cancelled);
        }
        Ok(())
    }

    /// Drive `operation` unless the token fires or the deadline passes first.
    /// The operation future is dropped on cancellation, which aborts any
    /// stream it was copying.
    pub async fn run<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(BackupError::Cancelled),
            _ = deadline_elapsed(self.deadline) => Err(BackupError::Cancelled),
            result = operation => result,
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
