//! Bounded retries of transport failures

use std::future::Future;
use std::time::Duration;

use crate::config::SyncSettings;
use crate::error::Result;

/// How transient failures are retried. Only [`Error::is_retryable`](crate::error::Error::is_retryable) errors are
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    retries: u32,
    /// Doubles after every retry
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration) -> Self {
        Self { retries, base_delay }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self::new(settings.transport_retries, settings.retry_base_delay())
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(0, Duration::from_millis(0))
    }

    pub fn retries(&self) -> u32 { self.retries }

    /// The delay before retry number `attempt` (starting at 0)
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Run `operation` until it succeeds, fails with an error that is not worth retrying, or runs out of retries
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retries => {
                    let delay = self.delay_before(attempt);
                    log::warn!("{} failed ({}), retrying in {:?}", what, err, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::error::Error;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.delay_before(0), Duration::from_millis(200));
        assert_eq!(policy.delay_before(1), Duration::from_millis(400));
        assert_eq!(policy.delay_before(2), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn transport_failures_are_retried() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = policy.run("flaky", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(Error::transport("timeout")),
                n => Ok(n),
            }
        }).await;
        assert_eq!(result.unwrap(), 2);

        calls.store(0, Ordering::SeqCst);
        let result: Result<()> = policy.run("down", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transport("down"))
        }).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy.run("auth", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Auth { url: "https://cal.example.com".to_string() })
        }).await;
        assert!(matches!(result, Err(Error::Auth{..})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
