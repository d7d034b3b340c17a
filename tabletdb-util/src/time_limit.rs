use std::future::Future;
use std::time::Duration;

/// Poll `check` every `interval` until it returns `Some`, or until `limit`
/// elapses, in which case `None` is returned.
///
/// Replaces blocking wait-for-condition loops: callers get an explicit bound
/// instead of sharing a future across module boundaries.
pub async fn poll_until<T, F, Fut>(limit: Duration, interval: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(v) = check().await {
            return Some(v);
        }
        if tokio::time::Instant::now() + interval > deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}
