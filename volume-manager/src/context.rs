//! Per-call cancellation and deadline.

use std::future::{self, Future};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, VolumeError};

/// Cancellation and deadline supplied by the caller of a mount/unmount.
///
/// Logging is not carried here; callers attach their own span and the
/// manager adds volume fields to it.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining() == Some(Duration::ZERO)
    }

    /// Shorten `timeout` so it never runs past the deadline.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(timeout),
            None => timeout,
        }
    }

    /// Wait for `fut` unless the caller cancels or the deadline passes first.
    ///
    /// Cancellation wins over an expired deadline.
    pub async fn run<F: Future>(&self, step: Step<'_>, fut: F) -> Result<F::Output> {
        if self.is_cancelled() {
            return Err(step.cancelled());
        }
        if self.is_expired() {
            return Err(step.deadline_exceeded());
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(step.cancelled()),
            _ = deadline => Err(step.deadline_exceeded()),
            output = fut => Ok(output),
        }
    }
}

/// Identifies a lifecycle step for logs and errors.
#[derive(Debug, Clone, Copy)]
pub struct Step<'a> {
    pub operation: &'static str,
    pub volume_id: &'a str,
    pub usage: &'a str,
}

impl Step<'_> {
    pub(crate) fn deadline_exceeded(&self) -> VolumeError {
        VolumeError::DeadlineExceeded {
            volume_id: self.volume_id.to_string(),
            usage: self.usage.to_string(),
            operation: self.operation,
        }
    }

    pub(crate) fn cancelled(&self) -> VolumeError {
        VolumeError::Cancelled {
            volume_id: self.volume_id.to_string(),
            usage: self.usage.to_string(),
            operation: self.operation,
        }
    }
}
