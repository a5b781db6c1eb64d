//! Bounded, cancellable polling.
//!
//! [`until`] runs a read-only check immediately and then again every
//! `interval` until the check succeeds, reports a non-retryable error, the
//! attempt budget is used up, or the [`OperationContext`] is done. It is the
//! single engine behind both convergence waits and cleanup waits.
//!
//! # Example
//!
//! ```ignore
//! use keel_common::retry::{until, PollResult, RetryPolicy};
//!
//! until(&ctx, &RetryPolicy::default(), "wait_for_bundle", || async {
//!     match client.get_bundle(ns, name).await {
//!         Ok(Some(_)) => PollResult::Done(()),
//!         Ok(None) => PollResult::Retry(Error::not_found(..)),
//!         Err(e) => PollResult::Abort(e),
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::context::OperationContext;
use crate::Error;

/// Default delay between two polls of the same object
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Why the retry engine stopped polling without success
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryCause {
    /// The configured number of attempts was used up
    MaxAttemptsReached,
    /// The context deadline passed
    DeadlineExceeded,
    /// The context was cancelled
    Canceled,
}

impl std::fmt::Display for RetryCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxAttemptsReached => write!(f, "max attempts reached"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
            Self::Canceled => write!(f, "context canceled"),
        }
    }
}

/// Attempt budget and spacing for [`until`].
///
/// Injected into components at construction time so tests can swap in a
/// short, zero-delay policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of checks (0 = bounded only by the context deadline)
    pub max_attempts: u32,
    /// Delay between two checks
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with an explicit budget and interval
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Poll every `interval` until the context deadline
    pub fn until_deadline(interval: Duration) -> Self {
        Self::new(0, interval)
    }

    /// Policy for tests: `max_attempts` checks, no delay in between
    pub fn fake(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

/// Outcome of a single check
#[derive(Debug)]
pub enum PollResult<T> {
    /// The awaited state was observed
    Done(T),
    /// Not there yet; check again after the interval
    Retry(Error),
    /// Checking again cannot help; stop and return this error unchanged
    Abort(Error),
}

/// Run `check` until it reports `Done` or `Abort`, or the budget runs out.
///
/// On exhaustion or cancellation the most recent `Retry` error is returned
/// wrapped in [`Error::Retry`]; earlier failures are dropped. `Abort` errors
/// are returned untouched. A check that is still in flight when the context
/// is done is abandoned and reported as a failure.
pub async fn until<F, Fut, T>(
    ctx: &OperationContext,
    policy: &RetryPolicy,
    operation: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollResult<T>>,
{
    let mut attempt = 0u32;
    let mut last: Option<Error> = None;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            outcome = check() => outcome,
            cause = ctx.done() => {
                debug!(operation = %operation, attempt, %cause, "check interrupted");
                return Err(Error::retry(cause, last));
            }
        };

        let err = match outcome {
            PollResult::Done(value) => {
                trace!(operation = %operation, attempt, "check succeeded");
                return Ok(value);
            }
            PollResult::Abort(err) => {
                debug!(operation = %operation, attempt, error = %err, "check failed permanently");
                return Err(err);
            }
            PollResult::Retry(err) => err,
        };

        if policy.max_attempts > 0 && attempt >= policy.max_attempts {
            warn!(
                operation = %operation,
                attempt,
                error = %err,
                "giving up after max attempts"
            );
            return Err(Error::retry(RetryCause::MaxAttemptsReached, Some(err)));
        }

        trace!(operation = %operation, attempt, error = %err, "condition not met yet");
        last = Some(err);

        if let Some(cause) = ctx.err() {
            return Err(Error::retry(cause, last));
        }

        tokio::select! {
            biased;
            cause = ctx.done() => return Err(Error::retry(cause, last)),
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn unhealthy(n: u32) -> Error {
        Error::unhealthy("ns", format!("attempt-{}", n), "")
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let ctx = OperationContext::background();
        let result = until(&ctx, &RetryPolicy::fake(3), "op", || async {
            PollResult::Done(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ctx = OperationContext::background();

        let result = until(&ctx, &RetryPolicy::fake(5), "op", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    PollResult::Retry(unhealthy(n))
                } else {
                    PollResult::Done(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ctx = OperationContext::background();

        let err = until(&ctx, &RetryPolicy::fake(3), "op", || {
            let c = c.clone();
            async move { PollResult::<()>::Retry(unhealthy(c.fetch_add(1, Ordering::SeqCst))) }
        })
        .await
        .unwrap_err();

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(
            err.to_string(),
            "retry failed with max attempts reached, last error: managed resource ns/attempt-2 is not healthy"
        );
    }

    #[tokio::test]
    async fn test_abort_is_returned_unwrapped() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let ctx = OperationContext::background();

        let err = until(&ctx, &RetryPolicy::fake(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                PollResult::<()>::Abort(Error::internal("forbidden"))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_unbounded_policy() {
        let ctx = OperationContext::background().with_timeout(Duration::from_secs(10));
        let policy = RetryPolicy::until_deadline(Duration::from_secs(3));

        let err = until(&ctx, &policy, "op", || async {
            PollResult::<()>::Retry(unhealthy(0))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "retry failed with context deadline exceeded, last error: managed resource ns/attempt-0 is not healthy"
        );
    }

    #[tokio::test]
    async fn test_cancelled_context_still_runs_first_check() {
        let ctx = OperationContext::background();
        ctx.cancel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let err = until(&ctx, &RetryPolicy::fake(5), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                PollResult::<()>::Retry(unhealthy(0))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            Error::Retry {
                cause: RetryCause::Canceled,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_hanging_check() {
        let ctx = OperationContext::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = until(&ctx, &RetryPolicy::fake(5), "op", || async {
            std::future::pending::<PollResult<()>>().await
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "retry failed with context canceled");
    }
}
