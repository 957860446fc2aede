use std::{thread, time::Duration};

use tracing::{debug, warn};

/// How often and how patiently [`retry`] re-invokes a failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first. Treated as at least 1.
    pub max_attempts: u32,

    /// Delay before the first retry; doubled before each further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Sleep before retry number `attempt + 1`: `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Call `f` until it succeeds, it fails with an error `is_retryable` rejects,
/// or `policy.max_attempts` calls have been made. The last error is returned
/// unchanged.
pub fn retry<T, E, F, R>(policy: RetryPolicy, is_retryable: R, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || !is_retryable(&e) {
                    if attempt > 1 {
                        warn!(attempts = attempt, error = %e, "giving up after retries");
                    }
                    return Err(e);
                }

                let delay = policy.delay_for(attempt - 1);
                debug!(attempt, ?delay, error = %e, "retrying after failure");
                thread::sleep(delay);
            }
        }
    }
}
