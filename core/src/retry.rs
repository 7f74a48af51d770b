//! Bounded retry policy
//!
//! [`RetryPolicy`] re-invokes a fallible operation a fixed number of times
//! with a constant delay between attempts. The guard only ever asks for a
//! single retry, so there is no backoff curve here; exhaustion is surfaced
//! as [`Error::RetryExhausted`] rather than swallowed.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Retry policy: one initial attempt plus up to `attempts` retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    /// One retry after 100ms.
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Run `f`, retrying on failure until the policy is exhausted.
    pub fn run<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut last: Option<Error> = None;

        for attempt in 0..=self.attempts {
            if attempt > 0 {
                std::thread::sleep(self.delay);
            }
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(attempt, error = %e, "attempt failed");
                    last = Some(e);
                }
            }
        }

        Err(self.exhausted(last))
    }

    /// Async variant of [`RetryPolicy::run`].
    pub async fn run_async<T, F, Fut>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last: Option<Error> = None;

        for attempt in 0..=self.attempts {
            if attempt > 0 {
                tokio::time::sleep(self.delay).await;
            }
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(attempt, error = %e, "attempt failed");
                    last = Some(e);
                }
            }
        }

        Err(self.exhausted(last))
    }

    fn exhausted(&self, last: Option<Error>) -> Error {
        Error::RetryExhausted {
            attempts: self.attempts + 1,
            last: last
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
        }
    }
}
