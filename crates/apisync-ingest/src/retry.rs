//! Capped linear backoff shared by every remote call site
//!
//! Remote sources are retried without a ceiling: a degraded source stalls
//! the pipeline instead of failing it. Callers that need an upper bound wrap
//! the call in `tokio::time::timeout`.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Default delay added per consecutive failure (seconds)
pub const DEFAULT_BACKOFF_STEP_SECS: u64 = 1;

/// Default ceiling on the delay between attempts (seconds)
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 10;

/// Delay grows by `step` for every consecutive failure, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffPolicy {
    #[serde(with = "millis", rename = "step_ms")]
    pub step: Duration,
    #[serde(with = "millis", rename = "max_ms")]
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_BACKOFF_STEP_SECS),
            Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        )
    }
}

impl BackoffPolicy {
    pub fn new(step: Duration, max: Duration) -> Self {
        Self { step, max }
    }

    /// Delay to wait after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        self.step.saturating_mul(failures).min(self.max)
    }

    /// Run `operation` until it succeeds
    ///
    /// Every error is logged with the attempt number and the delay before
    /// the next try. There is no attempt limit.
    pub async fn retry_forever<T, E, F, Fut>(&self, what: &str, mut operation: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut failures: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return value,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.delay_for(failures);
                    warn!(
                        operation = what,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
