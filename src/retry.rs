//! Bounded exponential backoff with jitter for feed calls.

use std::future::Future;

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::logging::{json_warn, obj, v_int, v_str};

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Exponential delay for the given attempt, clamped and jittered.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Retry a fallible async operation; the last error is returned when the
/// budget is exhausted.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if attempt >= config.max_retries {
                    return Err(err);
                }
                let delay = config.delay_for_attempt(attempt);
                json_warn(
                    "retry",
                    obj(&[
                        ("operation", v_str(operation_name)),
                        ("attempt", v_int(attempt as i64 + 1)),
                        ("max", v_int(config.max_retries as i64 + 1)),
                        ("error", v_str(&err.to_string())),
                        ("delay_ms", v_int(delay.as_millis() as i64)),
                    ]),
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// HTTP statuses worth another attempt (timeouts, throttling, 5xx).
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
