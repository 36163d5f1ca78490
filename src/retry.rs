use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with full jitter, in the spirit of the bounded
/// retry windows the streaming driver and judge both need around flaky
/// upstream calls. No crate in this workspace's dependency tree supplies
/// retry/backoff semantics, so this stays a small in-house primitive.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.initial.as_secs_f64() * 2f64.powi(attempt as i32 - 1);
        let capped = exp.min(self.max.as_secs_f64());
        let jittered = rand::rng().random_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }

    /// Run `f` up to `max_attempts` times, sleeping with jittered exponential
    /// backoff between attempts. Returns the last error if all attempts fail.
    pub async fn run<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                }
            }
        }
    }
}

/// Backoff used for streaming-driver retries: 0.2s initial, 3s cap, 5 attempts.
pub const STREAM_RETRY: RetryPolicy =
    RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(3), 5);

/// Backoff used for judge-call retries: 0.2s initial, 2.5s cap, 3 attempts.
pub const JUDGE_RETRY: RetryPolicy = RetryPolicy::new(
    Duration::from_millis(200),
    Duration::from_millis(2500),
    3,
);
