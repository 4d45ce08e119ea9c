//! Exponential backoff with jitter and a bounded attempt count (§4.6).
//!
//! Extends a plain exponential-backoff retry with a cap and jitter, since §4.6 requires both:
//! "capped at a configured maximum; at most N attempts (default 6)".

use rand::Rng;
use std::{fmt::Debug, future::Future, time::Duration};
use tracing::warn;

/// Default maximum delivery attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;
/// Default backoff cap (§4.6: "capped at a configured maximum").
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug)]
pub struct RetryStrategy {
    pub max_attempts: u32,
    pub max_backoff: Duration,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryStrategy {
    /// Exponential delay for attempt `n` (1-indexed): `2^(n-1)` seconds, jittered by ±25% and
    /// capped at `max_backoff`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_secs = 2u64.saturating_pow(attempt.saturating_sub(1));
        let base = Duration::from_secs(base_secs).min(self.max_backoff);
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base.as_secs_f64() * jitter_fraction).min(self.max_backoff)
    }
}

/// Outcome of a retryable action, distinguishing errors that must never be retried (signature,
/// validation, blocked instance — §7) from ones that should be retried per `strategy`.
pub enum Attempt<T, E> {
    Done(T),
    Retryable(E),
    Permanent(E),
}

/// Runs `action` up to `strategy.max_attempts` times, sleeping with jittered exponential backoff
/// between retryable failures. Returns the terminal error (retryable exhaustion or the first
/// permanent failure) if `action` never succeeds.
pub async fn retry_with_backoff<T, E, F, A>(mut action: A, strategy: RetryStrategy) -> Result<T, E>
where
    E: Debug,
    F: Future<Output = Attempt<T, E>>,
    A: FnMut(u32) -> F,
{
    let mut attempt: u32 = 1;
    loop {
        match action(attempt).await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Permanent(error) => return Err(error),
            Attempt::Retryable(error) => {
                if attempt >= strategy.max_attempts {
                    return Err(error);
                }
                let delay = strategy.delay_for_attempt(attempt);
                warn!(?error, attempt, ?delay, "retryable failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn succeeds_without_retry() {
        let result: Result<i32, &str> =
            retry_with_backoff(|_attempt| async { Attempt::Done(42) }, RetryStrategy::default())
                .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn permanent_failure_does_not_retry() {
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            |_attempt| {
                calls += 1;
                async { Attempt::Permanent("bad request") }
            },
            RetryStrategy::default(),
        )
        .await;
        assert_eq!(result, Err("bad request"));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_then_returns_error() {
        let strategy = RetryStrategy {
            max_attempts: 2,
            max_backoff: Duration::from_millis(1),
        };
        let mut calls = 0;
        let result: Result<i32, &str> = retry_with_backoff(
            |_attempt| {
                calls += 1;
                async { Attempt::Retryable("timeout") }
            },
            strategy,
        )
        .await;
        assert_eq!(result, Err("timeout"));
        assert_eq!(calls, 2);
    }
}
