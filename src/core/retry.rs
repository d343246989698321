//! Retry logic with exponential backoff and jitter.
//!
//! Provides bounded waiting for fallible async operations with configurable
//! backoff and per-attempt timeouts. Health gating is built on this.

use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    pub max_attempts: u32,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 = double each time).
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays.
    pub jitter: bool,

    /// Timeout for each individual attempt.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            attempt_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for the given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add up to 25% jitter
            let jitter_factor = 1.0 + (rand_jitter() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple pseudo-random jitter (0.0 to 1.0).
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// A single attempt exceeded [`RetryConfig::attempt_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimeout(pub Duration);

impl std::fmt::Display for AttemptTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attempt timed out after {}ms", self.0.as_millis())
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error).
    pub result: Result<T, E>,

    /// Number of attempts made.
    pub attempts: u32,

    /// Total time spent (including delays).
    pub total_time: Duration,

    /// Whether the operation was retried.
    pub was_retried: bool,
}

impl<T, E> RetryResult<T, E> {
    /// Check if the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Get the result.
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// How often an interruptible backoff sleep checks its interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(25);

/// Retry an async operation while `should_retry` accepts the error.
///
/// An error rejected by `should_retry` ends the loop immediately. Attempts
/// that exceed the configured timeout fail with [`AttemptTimeout`]. Once
/// `interrupted` returns true no further attempt is made, and the backoff
/// sleep in progress is cut short; the last error is returned.
pub async fn retry_async_if<T, E, F, Fut, P, I>(
    config: &RetryConfig,
    should_retry: P,
    interrupted: I,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<AttemptTimeout>,
    P: Fn(&E) -> bool,
    I: Fn() -> bool,
{
    let start = std::time::Instant::now();
    let mut attempts = 0;
    let max_attempts = config.max_attempts + 1;

    loop {
        attempts += 1;
        let result = match config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(E::from(AttemptTimeout(limit))),
            },
            None => operation().await,
        };

        let done = match &result {
            Ok(_) => true,
            Err(e) => attempts >= max_attempts || !should_retry(e) || interrupted(),
        };
        if done || !sleep_unless(config.delay_for_attempt(attempts), &interrupted).await {
            return RetryResult {
                result,
                attempts,
                total_time: start.elapsed(),
                was_retried: attempts > 1,
            };
        }
    }
}

/// Sleep for `delay`, waking early when `interrupted` turns true. Returns
/// whether the full delay elapsed.
async fn sleep_unless<I: Fn() -> bool>(delay: Duration, interrupted: &I) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return true;
        }
        tokio::time::sleep((deadline - now).min(INTERRUPT_POLL)).await;
        if interrupted() {
            return false;
        }
    }
}
