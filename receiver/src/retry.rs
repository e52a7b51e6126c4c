// Copyright 2025 Kore Ledger, SL
// SPDX-License-Identifier: Apache-2.0

//! Retry strategies for opening broker consumers.
//!

use crate::Error;

use backoff::{ExponentialBackoff, backoff::Backoff};
use tracing::warn;

use std::{fmt::Debug, future::Future, time::Duration};

/// Pacing of consumer opening attempts.
pub trait RetryStrategy: Debug + Send + Sync {
    /// Maximum number of retries after the first attempt.
    fn max_retries(&self) -> usize;

    /// Wait before the next retry. `None` retries at once.
    fn next_backoff(&mut self) -> Option<Duration>;

    /// Starts a new series of attempts. Called before every activation.
    fn reset(&mut self) {}
}

/// Retries at once.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoIntervalStrategy(usize);

impl NoIntervalStrategy {
    pub fn new(max_retries: usize) -> Self {
        Self(max_retries)
    }
}

impl RetryStrategy for NoIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.0
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        None
    }
}

/// Waits the same period before every retry.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedIntervalStrategy {
    retries: usize,
    wait: Duration,
}

impl FixedIntervalStrategy {
    pub fn new(max_retries: usize, wait: Duration) -> Self {
        Self {
            retries: max_retries,
            wait,
        }
    }
}

impl RetryStrategy for FixedIntervalStrategy {
    fn max_retries(&self) -> usize {
        self.retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        Some(self.wait)
    }
}

/// Waits exponentially longer before each retry, restarting from the initial interval on every
/// activation.
#[derive(Debug, Default)]
pub struct ExponentialBackoffStrategy {
    retries: usize,
    backoff: ExponentialBackoff,
}

impl ExponentialBackoffStrategy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            retries: max_retries,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn max_retries(&self) -> usize {
        self.retries
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.backoff.next_backoff()
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }
}

/// Runs `operation` until it succeeds or `strategy` gives up. The last error is returned.
pub(crate) async fn with_retries<T, F, Fut>(
    what: &str,
    strategy: &mut dyn RetryStrategy,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < strategy.max_retries() => {
                attempt += 1;
                warn!("{} failed (attempt {}): {}", what, attempt, error);
                if let Some(wait) = strategy.next_backoff() {
                    tokio::time::sleep(wait).await;
                }
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_no_interval_strategy() {
        let mut strategy = NoIntervalStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), None);
    }

    #[test]
    fn test_fixed_interval_strategy() {
        let mut strategy = FixedIntervalStrategy::new(3, Duration::from_secs(1));
        assert_eq!(strategy.max_retries(), 3);
        assert_eq!(strategy.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_backoff_restarts_after_reset() {
        let mut strategy = ExponentialBackoffStrategy::new(3);
        assert_eq!(strategy.max_retries(), 3);
        for _ in 0..4 {
            assert!(strategy.next_backoff().is_some());
        }
        let initial = strategy.backoff.initial_interval;
        assert!(strategy.backoff.current_interval > initial);

        strategy.reset();
        assert_eq!(strategy.backoff.current_interval, initial);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up() {
        let mut strategy = NoIntervalStrategy::new(2);
        let mut calls = 0;
        let result: Result<(), Error> = with_retries("open", &mut strategy, || {
            calls += 1;
            async { Err(Error::Transport("down".to_owned())) }
        })
        .await;
        assert_eq!(result, Err(Error::Transport("down".to_owned())));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retries_recovers() {
        let mut strategy = NoIntervalStrategy::new(2);
        let mut calls = 0;
        let result = with_retries("open", &mut strategy, || {
            calls += 1;
            let current = calls;
            async move {
                if current < 2 {
                    Err(Error::Transport("down".to_owned()))
                } else {
                    Ok(current)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
    }
}
