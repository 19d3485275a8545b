use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetrySection;

use super::error::{ErrorKind, ScrapeResult};

/// Fixed-delay, fixed-count retry for idempotent operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retries: usize,
    delay: Duration,
    retry_on: Vec<ErrorKind>,
}

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

impl RetryPolicy {
    pub fn new(config: RetrySection) -> Self {
        Self::with_delay(
            config.retries,
            Duration::from_secs(config.delay_seconds),
            config.retry_on,
        )
    }

    pub fn with_delay(retries: usize, delay: Duration, retry_on: Vec<ErrorKind>) -> Self {
        Self {
            retries: retries.max(1),
            delay,
            retry_on,
        }
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn retries_on(&self, kind: ErrorKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Calls `operation` with the zero-based attempt index until it succeeds,
    /// fails with an error outside the retry set, or attempts run out.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        mut operation: F,
    ) -> ScrapeResult<RetryOutcome<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        let mut attempt = 0usize;
        loop {
            match operation(attempt).await {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt + 1,
                    });
                }
                Err(error) => {
                    attempt += 1;
                    if !self.retries_on(error.kind()) {
                        return Err(error);
                    }
                    if attempt >= self.retries {
                        warn!(operation = label, attempts = attempt, error = %error, "all attempts failed");
                        return Err(error);
                    }
                    warn!(
                        operation = label,
                        attempt,
                        delay_seconds = self.delay.as_secs(),
                        error = %error,
                        "retrying after failure"
                    );
                    if !self.delay.is_zero() {
                        sleep(self.delay).await;
                    }
                }
            }
        }
    }
}
