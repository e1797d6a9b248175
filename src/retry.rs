//! Connection retry policy.
//!
//! `Broker::connect()` never retries by itself; callers that want to wait for
//! a backend to come up use [`Broker::wait_for_connection`](crate::Broker::wait_for_connection),
//! which drives [`retry_with_backoff`] with the broker's [`RetryConfig`].
//!
//! # Retry Strategy
//!
//! - Only [`Error::Connection`](crate::Error::Connection) is retried
//! - Delays grow by `multiplier` and are capped at `max_delay`
//! - Every delay gets ±25% jitter so restarted workers do not reconnect in lockstep

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

use crate::{log_debug, BrokerConfig, Error};

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Constant delay between a fixed number of total attempts.
    pub fn fixed(total_attempts: u32, delay: Duration) -> Self {
        // ---
        Self {
            max_attempts: total_attempts.saturating_sub(1),
            multiplier: 1.0,
            initial_delay: delay,
            max_delay: delay,
        }
    }

    /// Sleep durations between attempts, before jitter.
    ///
    /// Yields exactly `max_attempts` values.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        // ---
        let growth = f64::from(self.multiplier.max(1.0));
        let cap = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(cap)), move |prev| {
            Some(Duration::from_secs_f64(prev.as_secs_f64() * growth).min(cap))
        })
        .take(self.max_attempts as usize)
    }
}

impl From<&BrokerConfig> for RetryConfig {
    /// `retry_max_count` attempts spaced by `retry_delay_ms`.
    fn from(config: &BrokerConfig) -> Self {
        Self::fixed(config.retry_max_count, config.retry_delay())
    }
}

impl Default for RetryConfig {
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-connection error, or
/// the schedule runs out. The last error is returned on exhaustion.
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: &RetryConfig,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let mut pauses = retry_config.schedule().enumerate();

    loop {
        let reason = match operation().await {
            Err(Error::Connection(reason)) => reason,
            other => return other,
        };

        let Some((done, pause)) = pauses.next() else {
            log_debug!("giving up after {} attempt(s): {reason}", retry_config.max_attempts + 1);
            return Err(Error::Connection(reason));
        };

        let pause = jittered(pause);
        log_debug!(
            "connect attempt {} failed ({reason}), next in {pause:?}",
            done + 1
        );
        sleep(pause).await;
    }
}

/// Scale `delay` by a factor drawn from `[0.75, 1.25)`.
fn jittered(delay: Duration) -> Duration {
    // ---
    let seed = RandomState::new().hash_one(std::time::SystemTime::now());
    let factor = 0.75 + (seed % 1000) as f64 / 2000.0;

    delay.mul_f64(factor)
}
