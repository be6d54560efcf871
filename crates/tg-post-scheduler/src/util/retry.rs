use crate::prelude::*;
use retry_policies::{RetryDecision, RetryPolicy};
use std::future::Future;
use std::time::{Duration, SystemTime};

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retry {
    /// The error is permanent, another attempt won't help
    Never,

    /// Wait as much as the retry policy says
    Backoff,

    /// The remote side told us how long to wait
    After(Duration),
}

/// The HTTP client already retries transient failures in its middleware.
/// This function covers the requests that don't go through it, i.e. the
/// ones issued by `teloxide` with its own HTTP client.
pub(crate) async fn retry<T, E, Fut>(
    policy: &impl RetryPolicy,
    f: impl Fn() -> Fut,
    classify: impl Fn(&E) -> Retry,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let start = SystemTime::now();
    let mut attempt = 0;
    loop {
        let err = match f().await {
            Ok(output) => {
                if attempt > 0 {
                    warn!(%attempt, "Request succeeded after a retry");
                }
                return Ok(output);
            }
            Err(err) => err,
        };

        let hint = classify(&err);

        if hint == Retry::Never {
            if attempt > 0 {
                warn!(%attempt, "Request failed with a non-retryable error after a retry");
            }
            return Err(err);
        }

        let execute_after = match policy.should_retry(start, attempt) {
            RetryDecision::Retry { execute_after } => execute_after,
            RetryDecision::DoNotRetry => {
                warn!(%attempt, err = tracing_err(&err), "Giving up retrying the request");
                return Err(err);
            }
        };

        let duration = match hint {
            Retry::After(duration) => duration,
            _ => execute_after
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        };

        warn!(
            %attempt,
            err = tracing_err(&err),
            duration = tracing_duration(duration),
            "Sleeping before the next attempt",
        );

        tokio::time::sleep(duration).await;

        attempt += 1;
    }
}

/// Tells apart transient Telegram failures from the ones that will
/// happen again no matter how many times we retry.
pub(crate) fn classify_tg_error(err: &teloxide::RequestError) -> Retry {
    use teloxide::RequestError;

    match err {
        RequestError::RetryAfter(secs) => Retry::After(*secs),
        RequestError::Network(_) | RequestError::Io(_) => Retry::Backoff,
        _ => Retry::Never,
    }
}
