use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use reqwest_retry::{policies::ExponentialBackoff, RetryDecision, RetryPolicy};

use crate::{MonoplaneError, MonoplaneResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the exponential backoff policy shared by HTTP clients and call-site retries.
pub fn backoff_policy(max_retries: u32, min: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff::builder()
        .retry_bounds(min, max)
        .build_with_max_retries(max_retries)
}

/// Runs `op`, retrying transient failures according to `policy`.
///
/// Non-transient errors are returned immediately. A transient error that survives every retry is
/// surfaced as [`MonoplaneError::Unavailable`].
pub async fn retry_transient<T, F, Fut>(
    policy: &ExponentialBackoff,
    label: &str,
    mut op: F,
) -> MonoplaneResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MonoplaneResult<T>>,
{
    let started_at = SystemTime::now();
    let mut past_retries = 0;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e),
        };

        match policy.should_retry(started_at, past_retries) {
            RetryDecision::Retry { execute_after } => {
                let wait = execute_after
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                tracing::warn!(
                    "{} failed (attempt {}), retrying in {:?}: {}",
                    label,
                    past_retries + 1,
                    wait,
                    error
                );
                tokio::time::sleep(wait).await;
                past_retries += 1;
            }
            RetryDecision::DoNotRetry => {
                tracing::error!("{} failed after {} retries: {}", label, past_retries, error);
                return Err(match error {
                    e @ MonoplaneError::Unavailable(_) => e,
                    e => MonoplaneError::Unavailable(format!("{label}: {e}")),
                });
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
