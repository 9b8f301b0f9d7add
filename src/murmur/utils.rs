use std::future::Future;
use std::time::Duration;

use crate::murmur::config::RetryPolicy;
use crate::murmur::error::Result;

/// Runs an idempotent operation, retrying transient store failures with
/// exponential backoff. Any other error is returned immediately.
pub(crate) async fn retry_idempotent<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                let delay_ms = policy.delay_ms(attempt);
                tracing::warn!(
                    target: "murmur::utils::retry_idempotent",
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    operation,
                    attempt + 1,
                    policy.max_attempts,
                    delay_ms,
                    e
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
