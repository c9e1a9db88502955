use crate::prelude::*;
use retry_policies::{RetryDecision, RetryPolicy};
use std::future::Future;
use std::time::{Duration, SystemTime};

/// Retries the operation built by `f` while `is_retryable` says so and the
/// policy allows it. Used for requests that must be rebuilt on every attempt
/// (e.g. signed ones), where the retrying HTTP middleware would resend the
/// same body.
pub(crate) async fn retry_http<T, E, Fut>(
    policy: &impl RetryPolicy,
    f: impl Fn() -> Fut,
    is_retryable: impl Fn(&E) -> bool,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let start = SystemTime::now();
    let mut attempt = 0;
    loop {
        let err = match f().await {
            Ok(output) => {
                if attempt > 0 {
                    warn!(attempt, "HTTP request succeeded after a retry");
                }
                return Ok(output);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            if attempt > 0 {
                warn!(attempt, "HTTP request failed with a non-retryable error after a retry");
            }
            return Err(err);
        }

        let execute_after = match policy.should_retry(start, attempt) {
            RetryDecision::Retry { execute_after } => execute_after,
            RetryDecision::DoNotRetry => {
                warn!(attempt, "Giving up retrying HTTP request");
                return Err(err);
            }
        };

        let duration = execute_after
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        warn!(
            attempt,
            duration = format_args!("{duration:.2?}"),
            "Sleeping before the next attempt",
        );

        tokio::time::sleep(duration).await;

        attempt += 1;
    }
}
