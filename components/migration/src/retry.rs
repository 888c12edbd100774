use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use persistence::PersistenceError;
use tokio::sync::Notify;

/// Re-run an operation on transient persistence failures.
///
/// [`PersistenceError::Io`] and [`PersistenceError::Unreachable`] are retried after waiting `interval`, up to
/// `max_attempts` executions in total. Other errors are returned right away. Waits can be cut short through
/// [`RetryPolicy::interrupt`], which moves every waiting operation on to its next attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    interval: Duration,
    interrupt: Arc<Notify>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            interrupt: Arc::new(Notify::new()),
        }
    }

    /// Wake up all operations currently waiting for their next attempt.
    ///
    /// May be called from any thread, including signal handlers running outside of the runtime.
    pub fn interrupt(&self) {
        self.interrupt.notify_waiters();
    }

    /// Execute `operation` until it succeeds, fails with a non-retryable error or attempts are exhausted.
    ///
    /// After exhaustion the most recent I/O error is returned if there was one, the most recent
    /// unreachable error otherwise.
    pub async fn execute<F, Fut, T>(
        &self,
        description: &str,
        mut operation: F,
    ) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistenceError>>,
    {
        let mut last_io = None;
        let mut last_unreachable = None;
        for attempt in 1..=self.max_attempts {
            let e = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            error!(
                "Attempt {}/{} to {} failed: {}",
                attempt, self.max_attempts, description, e
            );
            if let PersistenceError::Io(_) = e {
                last_io = Some(e);
            } else {
                last_unreachable = Some(e);
            }

            if attempt < self.max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {}
                    _ = self.interrupt.notified() => {
                        error!("Interrupted while waiting to retry {}", description);
                    }
                }
            }
        }

        match last_io.or(last_unreachable) {
            Some(e) => {
                warn!("Giving up trying to {} after {} attempts", description, self.max_attempts);
                Err(e)
            }
            None => Err(PersistenceError::Internal(format!(
                "no attempt made to {description}"
            ))),
        }
    }
}

impl From<&config::Retry> for RetryPolicy {
    fn from(retry: &config::Retry) -> Self {
        Self::new(retry.max_attempts, retry.interval())
    }
}
