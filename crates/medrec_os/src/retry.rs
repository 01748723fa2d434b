#![forbid(unsafe_code)]

use std::env;
use std::fmt::Display;
use std::thread;
use std::time::Duration;

use tracing::warn;

pub const RETRY_MAX_ATTEMPTS_DEFAULT: u16 = 3;
pub const RETRY_INITIAL_BACKOFF_MS_DEFAULT: u64 = 100;
pub const RETRY_MAX_BACKOFF_MS_DEFAULT: u64 = 2_000;

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn mvp_v1() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS_DEFAULT,
            initial_backoff_ms: RETRY_INITIAL_BACKOFF_MS_DEFAULT,
            max_backoff_ms: RETRY_MAX_BACKOFF_MS_DEFAULT,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    pub fn from_env() -> Self {
        let max_attempts = env::var("MEDREC_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<u16>().ok())
            .filter(|v| (1..=10).contains(v))
            .unwrap_or(RETRY_MAX_ATTEMPTS_DEFAULT);
        let initial_backoff_ms = env::var("MEDREC_RETRY_INITIAL_BACKOFF_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v <= 10_000)
            .unwrap_or(RETRY_INITIAL_BACKOFF_MS_DEFAULT);
        let max_backoff_ms = env::var("MEDREC_RETRY_MAX_BACKOFF_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v <= 60_000)
            .unwrap_or(RETRY_MAX_BACKOFF_MS_DEFAULT);
        Self {
            max_attempts,
            initial_backoff_ms,
            max_backoff_ms: max_backoff_ms.max(initial_backoff_ms),
        }
    }

    /// Delay before attempt `failed_attempts + 1`.
    pub fn backoff_after(&self, failed_attempts: u16) -> Duration {
        let exp = u32::from(failed_attempts.saturating_sub(1)).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub fn run_with_retry<T, E, F>(
    policy: &RetryPolicy,
    op_label: &'static str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u16 = 1;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(err) if attempt < max_attempts && is_transient(&err) => {
                let delay = policy.backoff_after(attempt);
                warn!(
                    op = op_label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
