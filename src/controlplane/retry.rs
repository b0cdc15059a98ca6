//! Bounded retry for optimistic-concurrency conflicts
//!
//! Conflicts are always resolved locally: re-fetch, recompute, re-apply.
//! Any other error ends the retry immediately.

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry budget for conflicting patches
#[derive(Debug, Clone)]
pub struct ConflictRetry {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Upper bound for a single delay
    pub max_interval: Duration,
}

impl Default for ConflictRetry {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
        }
    }
}

impl ConflictRetry {
    /// Retry without delays, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent. The last conflict is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Err(err @ Error::Conflict { .. }) if attempt < self.max_attempts.max(1) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_interval);
                    debug!(
                        "Conflict on {} (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, err
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> Error {
        Error::Conflict {
            kind: "PersistentVolumeClaim".into(),
            name: "disk-1".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = ConflictRetry::immediate(3)
            .run("test", move |_| async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = ConflictRetry::immediate(3)
            .run("test", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            })
            .await;
        assert_matches!(result, Err(Error::Conflict { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = ConflictRetry::immediate(5)
            .run("test", move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::unavailable("patch", "timeout"))
            })
            .await;
        assert_matches!(result, Err(Error::Unavailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
