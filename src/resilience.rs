//! Resilience utilities: bounded retry and rate limiting.
//!
//! - [`retry_until_ok`]: fixed-backoff retry for metadata and topology calls
//! - [`RateLimiter`]: token bucket used to throttle the initial collection dump
//!
//! The retry helper is deliberately simple: a fixed delay, a bounded number
//! of attempts, and the last error re-raised. It is never used inside the
//! tailer's consume loop, which has its own reconnect state machine.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> oplog_connector::Result<()> {
//! use oplog_connector::resilience::{retry_until_ok, RetryConfig};
//!
//! let shards = retry_until_ok(&RetryConfig::metadata(), "list_shards", || async {
//!     Ok::<_, oplog_connector::ConnectorError>(vec!["shard0".to_string()])
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the fixed-backoff retry helper.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,

    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::metadata()
    }
}

impl RetryConfig {
    /// Retry for metadata/topology calls: 60 attempts, one second apart.
    ///
    /// Rides out a primary election (typically 10-30s) without giving up.
    pub fn metadata() -> Self {
        Self {
            max_attempts: 60,
            delay: Duration::from_secs(1),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(10),
        }
    }
}

/// Call `f` until it succeeds, sleeping `config.delay` between failures.
///
/// Any error is retried. After `config.max_attempts` failures the last
/// error is returned.
pub async fn retry_until_ok<F, Fut, T, E>(config: &RetryConfig, operation: &str, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_if(config, operation, |_| true, f).await
}

/// Like [`retry_until_ok`], but only retries errors accepted by `should_retry`.
///
/// Errors the predicate rejects are returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation: &str,
    should_retry: P,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!(operation, attempts, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempts < max_attempts && should_retry(&e) => {
                warn!(
                    operation,
                    attempts,
                    max_attempts,
                    error = %e,
                    "Operation failed, retrying"
                );
                crate::metrics::record_retry(operation);
                tokio::time::sleep(config.delay).await;
            }
            Err(e) => {
                if attempts >= max_attempts {
                    warn!(operation, attempts, error = %e, "Operation failed, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Configuration for rate limiting.
///
/// Uses a token bucket algorithm: tokens refill at `refill_rate` per second,
/// up to `burst_size` tokens. Each document consumes one token.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum tokens that can be accumulated (burst capacity).
    pub burst_size: u32,

    /// Tokens added per second (sustained rate).
    pub refill_rate: u32,
}

impl RateLimitConfig {
    /// Sustained `per_second` documents with a one-second burst.
    pub fn per_second(per_second: u32) -> Self {
        Self {
            burst_size: per_second,
            refill_rate: per_second,
        }
    }
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// Acquire a permit, waiting until one is available.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}
