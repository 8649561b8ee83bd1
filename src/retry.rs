use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: false,
        }
    }
}

/// Reusable exponential-backoff retry executor.
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub async fn execute<F, Fut, T, E>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        let mut delay = self.config.initial_delay;

        loop {
            attempt += 1;

            match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("attempt {} succeeded after retries", attempt);
                    }
                    return Ok(result);
                }
                Err(error) if attempt >= self.config.max_attempts => {
                    warn!(
                        "giving up after {} attempts: {}",
                        self.config.max_attempts, error
                    );
                    return Err(error);
                }
                Err(error) => {
                    warn!("attempt {} failed: {}. retrying in {:?}", attempt, error, delay);
                    sleep(delay).await;
                    delay = self.next_delay(delay);
                }
            }
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let mut next =
            Duration::from_secs_f64(current.as_secs_f64() * self.config.exponential_base);

        if self.config.jitter {
            let jitter = next.as_secs_f64() * 0.1 * rand::random::<f64>();
            next = Duration::from_secs_f64(next.as_secs_f64() + jitter);
        }

        next.min(self.config.max_delay)
    }
}

/// Capped exponential backoff for retry `attempt` (1-based): base * 2^(attempt-1).
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent);
    delay.min(cap)
}
