use crate::error::{Error, Result};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Bounded retry policy for transient network failures.
///
/// Only failures that happen before a response is received are retried.
/// Attempt `n` (1-based) of a retry waits `backoff * n` before starting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry)
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Longest the request body may stall before the attempt is abandoned.
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
    pub max_concurrent_uploads: Option<usize>,
    pub user_agent: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            retry: RetryPolicy::default(),
            max_concurrent_uploads: None,
            user_agent: None,
        }
    }
}

impl ManagerConfig {
    /// Checks that every timeout is non-zero and that a
    /// concurrency limit, when present, allows at least one upload.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::ConfigError(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::ConfigError(
                "Read timeout must be greater than zero".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::ConfigError(
                "Write timeout must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_uploads == Some(0) {
            return Err(Error::ConfigError(
                "Concurrent upload limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.read_timeout = timeout;
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_uploads(mut self, limit: usize) -> Self {
        self.max_concurrent_uploads = Some(limit);
        self
    }
}
