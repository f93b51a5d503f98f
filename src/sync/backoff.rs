//! Bounded retry for automatically triggered commands.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Backoff schedule and bounds for one retried command.
#[derive(Clone, Copy)]
pub struct RetryPolicy<'a> {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: Option<usize>,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryPolicy<'a> {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            max_attempts: None,
            cancellation: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Whether a failure class is worth another attempt.
pub enum RetryDisposition {
    Retry,
    Abort,
}

/// Run `operation` under the policy, doubling the backoff between attempts up
/// to the cap.
///
/// `classify` decides per error whether to retry; `on_retry` observes every
/// retryable failure, including the final one (its last argument is false
/// when no further attempt follows). Exhaustion and abort both return the
/// last error unmodified. A stuck command halts observably instead of
/// looping forever.
pub async fn run_with_retry<'a, T, F, Fut, L, C>(
    policy: RetryPolicy<'a>,
    mut operation: F,
    mut on_retry: L,
    mut classify: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        if let Some(token) = policy.cancellation {
            if token.is_cancelled() {
                return Err(anyhow!("command retry cancelled"));
            }
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match classify(attempt, &err) {
                RetryDisposition::Abort => return Err(err),
                RetryDisposition::Retry => {
                    let exhausted = policy
                        .max_attempts
                        .map(|max| attempt >= max)
                        .unwrap_or(false);

                    on_retry(attempt, backoff, &err, !exhausted);

                    if exhausted {
                        return Err(err);
                    }

                    pause_between_attempts(backoff, policy.cancellation).await?;
                    backoff = next_backoff(backoff, policy.max_backoff);
                }
            },
        }
    }
}

async fn pause_between_attempts(
    delay: Duration,
    cancellation: Option<&CancellationToken>,
) -> Result<()> {
    if delay.is_zero() {
        yield_now().await;
        return Ok(());
    }

    if let Some(token) = cancellation {
        tokio::select! {
            _ = token.cancelled() => Err(anyhow!("command retry cancelled")),
            _ = sleep(delay) => Ok(()),
        }
    } else {
        sleep(delay).await;
        Ok(())
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}
