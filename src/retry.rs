//! Bounded exponential-backoff retry for async operations.
//!
//! Every error is treated as retryable. Permanent failures (e.g. a rejected
//! request) are retried exactly like transient ones under the default policy.

use rand::Rng;
use serde::Deserialize;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(300);

/// Longest wait between two attempts, whatever the policy asks for.
pub const MAX_BACKOFF: Duration = Duration::from_secs(u32::MAX as u64);

/// Retry parameters. Immutable for the duration of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Additional attempts after the first one
  pub max_retries: u32,
  pub base_backoff: Duration,
  /// Draw each delay uniformly from `[d/2, d]` instead of using `d`
  pub jitter: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: DEFAULT_RETRIES,
      base_backoff: DEFAULT_BASE_BACKOFF,
      jitter: false,
    }
  }
}

impl RetryPolicy {
  pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
    Self {
      max_retries,
      base_backoff,
      jitter: false,
    }
  }

  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  /// Total number of times the operation may run.
  pub fn total_attempts(&self) -> u32 {
    self.max_retries.saturating_add(1)
  }

  /// Un-jittered wait after the failed attempt number `attempt` (0-based):
  /// `base_backoff * 2^attempt`.
  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self.base_backoff.saturating_mul(factor)
  }

  fn delay_for(&self, attempt: u32) -> Duration {
    let delay = self.backoff_for(attempt).min(MAX_BACKOFF);
    if self.jitter && !delay.is_zero() {
      delay.mul_f64(rand::rng().random_range(0.5..=1.0))
    } else {
      delay
    }
  }
}

/// Serde form of [`RetryPolicy`] used in configuration files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub retries: u32,
  pub base_backoff_ms: u64,
  pub jitter: bool,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      retries: DEFAULT_RETRIES,
      base_backoff_ms: DEFAULT_BASE_BACKOFF.as_millis() as u64,
      jitter: false,
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    RetryPolicy::new(config.retries, Duration::from_millis(config.base_backoff_ms))
      .with_jitter(config.jitter)
  }
}

/// Runs operations under a [`RetryPolicy`].
///
/// The backoff wait is a Tokio sleep, so other tasks keep running between
/// attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
  policy: RetryPolicy,
}

impl RetryExecutor {
  pub fn new(policy: RetryPolicy) -> Self {
    Self { policy }
  }

  pub fn policy(&self) -> &RetryPolicy {
    &self.policy
  }

  /// Run `op` until it succeeds or the policy is exhausted.
  pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
  where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    self.run_notify(op, |_, _| {}).await
  }

  /// Like [`run`](Self::run), calling `on_error(attempt, &error)` after every
  /// failed attempt, including the last one. `attempt` is 1-based.
  ///
  /// On exhaustion the error of the last attempt is returned.
  pub async fn run_notify<T, E, F, Fut, N>(&self, mut op: F, mut on_error: N) -> Result<T, E>
  where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    N: FnMut(u32, &E),
  {
    let mut attempt = 0u32;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(error) => {
          on_error(attempt + 1, &error);

          if attempt >= self.policy.max_retries {
            warn!(
              attempts = attempt + 1,
              "Giving up after retries exhausted: {}", error
            );
            return Err(error);
          }

          let delay = self.policy.delay_for(attempt);
          debug!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, backing off: {}",
            error
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}
