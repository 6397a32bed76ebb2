use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::remote::RemoteError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounded retries with exponential backoff, shared by every remote call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            Duration::from_secs(1),
            Duration::from_secs(30),
            true,
        )
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration, jitter: bool) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
            jitter,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, false)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Runs `op` until it succeeds, fails permanently or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = match err.retry_after() {
                        Some(hint) => hint.min(self.max),
                        None => self.delay(attempt),
                    };
                    warn!(
                        operation = label,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
