//! Bounded retry with exponential backoff.
//!
//! Thin layer over [`tokio_retry`]'s strategies so that every component in
//! the workspace names its retry budget the same way. Transient failures are
//! retried up to `max_attempts` total tries; the caller decides what counts
//! as transient via the error predicate.

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tracing::warn;

/// A bounded attempts-times-backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first.
    pub max_attempts: usize,
    /// Delay before the first retry; doubles each retry.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy suitable for coordination-service and filesystem wobbles.
    pub fn transient() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
        }
    }

    /// Iterator over the delays this policy will sleep between tries.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.base_delay.as_millis() as u64 / 2)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

/// Run `op` until it succeeds, the error stops being transient according to
/// `is_transient`, or the policy's attempts are exhausted. The last error is
/// returned in the failure cases.
pub async fn retry<T, E, F, Fut, P>(
    policy: RetryPolicy,
    what: &'static str,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut delays = policy.delays();
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => match delays.next() {
                Some(delay) => {
                    warn!(%e, what, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(%e, what, "retries exhausted");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn delay_count_matches_attempts() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delays().count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let res: Result<usize, String> = retry(
            RetryPolicy::transient(),
            "test op",
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("flaky".to_string())
                } else {
                    Ok(n)
                }
            },
        )
        .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let res: Result<(), String> = retry(
            RetryPolicy::transient(),
            "test op",
            |_| false,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("permanent".to_string())
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
