use anyhow::{anyhow, Result};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Error raised by a backend that asked the caller to slow down.
#[derive(Debug, Clone)]
pub struct RateLimited {
    pub status: StatusCode,
    pub retry_after: Option<Duration>,
    pub message: String,
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limited ({}): {}", self.status, self.message)
    }
}

impl std::error::Error for RateLimited {}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    let code = status.as_u16();
    if code == 529 || code == 503 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
        || lower.contains("quota")
        || lower.contains("overloaded")
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<u64>().ok().map(Duration::from_secs)
}

/// Bounded exponential backoff: waits `base × 2^attempt` between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the last error.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt + 1 < attempts {
                        let mut wait = self.delay_for(attempt);
                        if let Some(limited) = err.downcast_ref::<RateLimited>()
                            && let Some(hint) = limited.retry_after
                            && hint > wait
                        {
                            wait = hint.min(self.max_delay);
                        }
                        warn!(
                            "{} failed; retrying in {:.1}s (attempt {}/{}): {:#}",
                            label,
                            wait.as_secs_f32(),
                            attempt + 1,
                            attempts,
                            err
                        );
                        sleep(wait).await;
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("{} was never attempted", label)))
    }
}
