//! Bounded retry with exponential backoff around plugin calls.
//!
//! Only clearly transient statuses are retried: a timed out attempt,
//! `ResourceExhausted` and `Unavailable`. The plugin protocol does not
//! distinguish finer recoverable conditions, so everything else is surfaced
//! to the caller on the first failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::{OpContext, Step};
use crate::error::VolumeError;
use crate::metrics;

/// Per-attempt timeout for a plugin mount action.
pub const DEFAULT_MOUNT_ACTION_TIMEOUT: Duration = Duration::from_secs(120);
/// Total attempts (initial call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Upper bound on a single backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff multiplier (exponential factor).
pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

/// Retry budget applied to every plugin call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    #[serde(with = "millis")]
    pub max_backoff: Duration,
    pub multiplier: u32,
    #[serde(with = "millis")]
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            per_attempt_timeout: DEFAULT_MOUNT_ACTION_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Check if a plugin status is worth retrying.
pub fn is_retryable(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::DeadlineExceeded | tonic::Code::ResourceExhausted | tonic::Code::Unavailable
    )
}

/// Execute a plugin call under the retry policy.
///
/// Each attempt is bounded by the per-attempt timeout (shortened to the
/// caller's deadline). Cancellation or an expired deadline aborts at once;
/// nothing the plugin may already have done is rolled back.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    ctx: &OpContext,
    call: Step<'_>,
    mut operation: F,
) -> Result<T, VolumeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, tonic::Status>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        if ctx.is_cancelled() {
            return Err(call.cancelled());
        }
        if ctx.is_expired() {
            return Err(call.deadline_exceeded());
        }
        let attempt_timeout = ctx.clamp(policy.per_attempt_timeout);

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(call.cancelled()),
            outcome = tokio::time::timeout(attempt_timeout, operation()) => outcome,
        };

        let status = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(status)) => status,
            Err(_) if ctx.is_expired() => return Err(call.deadline_exceeded()),
            Err(_) => tonic::Status::deadline_exceeded(format!(
                "attempt timed out after {:?}",
                attempt_timeout
            )),
        };

        if !is_retryable(&status) {
            if attempt > 1 {
                warn!(
                    operation = call.operation,
                    volume_id = call.volume_id,
                    attempts = attempt,
                    code = ?status.code(),
                    "Operation failed after retries"
                );
            }
            return Err(VolumeError::FatalRemote {
                volume_id: call.volume_id.to_string(),
                usage: call.usage.to_string(),
                operation: call.operation,
                status,
            });
        }

        if attempt >= max_attempts {
            warn!(
                operation = call.operation,
                volume_id = call.volume_id,
                attempts = attempt,
                code = ?status.code(),
                "Retry budget exhausted"
            );
            return Err(VolumeError::TransientRemote {
                volume_id: call.volume_id.to_string(),
                usage: call.usage.to_string(),
                operation: call.operation,
                attempts: attempt,
                status,
            });
        }

        let backoff = policy.backoff(attempt);
        if ctx.remaining().is_some_and(|remaining| remaining <= backoff) {
            return Err(call.deadline_exceeded());
        }

        warn!(
            operation = call.operation,
            volume_id = call.volume_id,
            attempt = attempt,
            max_attempts = max_attempts,
            code = ?status.code(),
            backoff_ms = backoff.as_millis() as u64,
            "Retryable error, backing off"
        );
        metrics::record_retry(call.operation);

        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(call.cancelled()),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}
