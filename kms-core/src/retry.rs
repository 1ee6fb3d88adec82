use crate::config::RetryPolicy;
use std::future::Future;

/// Retry an async operation with linear backoff while `retryable` holds.
pub async fn retry_async<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    mut op: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(err) if attempt >= policy.max_attempts || !retryable(&err) => return Err(err),
            Err(_) => {
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}
