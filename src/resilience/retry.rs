//! # Retry with backoff
//!
//! Retries operations that failed with a retryable [`TaskerError`]
//! (transient store errors, timeouts) using exponential backoff. Callers with a
//! time budget pass a deadline; no retry is started if its delay would end past
//! the deadline, and the last error is returned instead.

use crate::config::BackoffConfig;
use crate::error::TaskerResult;
use std::future::Future;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    backoff: &BackoffConfig,
    deadline: Option<Instant>,
    mut op: F,
) -> TaskerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TaskerResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = %operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        if backoff.max_attempts.is_some_and(|max| attempt >= max) {
            warn!(operation = %operation, attempt, error = %err, "Retry attempts exhausted");
            return Err(err);
        }

        let delay = backoff.delay_for_attempt(attempt);
        if deadline.is_some_and(|deadline| Instant::now() + delay >= deadline) {
            warn!(operation = %operation, attempt, error = %err, "Deadline reached, giving up retries");
            return Err(err);
        }

        warn!(
            operation = %operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, retrying with backoff"
        );
        sleep(delay).await;
    }
}
