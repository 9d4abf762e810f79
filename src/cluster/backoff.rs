use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;

use crate::config::BackoffConfig;

/// Run `op` until it succeeds or `config.max_retries` attempts have failed,
/// sleeping an exponentially growing, jittered delay between attempts.
/// Returns the last error once retries are exhausted.
pub async fn retry<T, E, F, Fut>(config: &BackoffConfig, what: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.min_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(2.0)
        .with_max_elapsed_time(None)
        .build();

    let attempts = config.max_retries.max(1);
    let mut attempt = 0;
    let operation = || {
        attempt += 1;
        let last = attempt >= attempts;
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if last {
                    backoff::Error::permanent(e)
                } else {
                    backoff::Error::transient(e)
                }
            })
        }
    };
    let notify = |e: E, delay: Duration| {
        tracing::debug!(what, error = %e, delay = ?delay, "Attempt failed, backing off");
    };

    backoff::future::retry_notify(policy, operation, notify).await
}
