//! Read retry policy.
//
// Timeouts and malformed responses are retried; anything else (a dropped
// link, a disabled interface) fails the read immediately.

use crate::transport::TransportError;
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Defines a policy for retrying a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `max_attempts` (at least one) with `backoff_delay` between them.
    pub fn new(max_attempts: u32, backoff_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_delay,
        }
    }

    /// The same backoff with an instruction-specific attempt budget.
    pub fn with_attempts(&self, attempts: Option<u32>) -> Self {
        Self::new(attempts.unwrap_or(self.max_attempts), self.backoff_delay)
    }

    /// Run `op` against `target` until it succeeds or the budget is spent.
    ///
    /// Returns the value with the number of attempts used. When every attempt
    /// fails with a retryable error the result is
    /// [`TransportError::ReadFailure`] carrying the last cause.
    pub async fn run<S, T, F>(&self, target: &mut S, mut op: F) -> Result<(T, u32), TransportError>
    where
        S: ?Sized + Send,
        F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(&mut *target).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if e.is_retryable() => {
                    if attempt >= max_attempts {
                        return Err(TransportError::ReadFailure {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    debug!(attempt, max_attempts, error = %e, "Read attempt failed, retrying");
                    sleep(self.backoff_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
