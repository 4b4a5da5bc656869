//! Retry with exponential backoff for recoverable failures.

use std::future::Future;
use std::time::Duration;

use crate::connection::Connection;
use crate::error::Result;
use crate::pool::{Pool, PoolConnection};
use crate::result_set::RowSet;

/// Backoff policy: delay for attempt `n` is
/// `min(initial_delay × backoff_multiplier^n, max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            initial_delay,
            ..RetryPolicy::default()
        }
    }

    /// The clamped delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `operation`, retrying while it fails with a recoverable error.
///
/// Non-recoverable errors are returned after a single attempt; recoverable
/// ones are retried up to `max_retries` times with backoff, so the
/// operation runs at most `max_retries + 1` times.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_recoverable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                log::warn!(
                    "recoverable {} error; retry {attempt}/{} in {delay:?}: {error}",
                    error.code(),
                    policy.max_retries,
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// A pool wrapped with retry-on-acquire semantics.
///
/// Only recoverable (pool-tier) failures are retried. Query execution
/// errors surface immediately, and releasing a connection is never retried.
pub struct RetryingPool<C: Connection> {
    pool: Pool<C>,
    policy: RetryPolicy,
}

impl<C: Connection> RetryingPool<C> {
    pub fn new(pool: Pool<C>, policy: RetryPolicy) -> Self {
        RetryingPool { pool, policy }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn acquire(&self) -> Result<PoolConnection<C>> {
        retry(&self.policy, || self.pool.acquire()).await
    }

    /// Acquire with retries, then execute exactly once.
    pub async fn query(&self, sql: &str) -> Result<RowSet> {
        let mut conn = self.acquire().await?;
        let result = conn.execute(sql, &[]).await;
        conn.release().await;
        result
    }
}

impl<C: Connection> Clone for RetryingPool<C> {
    fn clone(&self) -> Self {
        RetryingPool {
            pool: self.pool.clone(),
            policy: self.policy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn delays_form_a_clamped_geometric_sequence() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(1), Duration::from_millis(20));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
        assert_eq!(policy.delay(3), Duration::from_millis(80));
        assert_eq!(policy.delay(4), Duration::from_millis(100)); // clamped
        assert_eq!(policy.delay(10), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failures_are_retried_with_backoff() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(100),
        };

        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let value = retry(&policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(Error::acquire("transient"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 10 + 20 + 40
        assert_eq!(started.elapsed(), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn non_recoverable_failures_make_exactly_one_attempt() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let attempts = AtomicU32::new(0);
        let error = retry(&RetryPolicy::default(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), Error>(Error::query("syntax error")) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!error.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_failures_exhaust_the_budget() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10),
        };

        let attempts = AtomicU32::new(0);
        let error = retry(&policy, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), Error>(Error::PoolExhausted { max_waiting: 0 }) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3); // max_retries + 1
        assert!(error.is_recoverable());
    }
}
