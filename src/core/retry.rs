//! Caller-side retry for busy lines

use super::channel::Channel;
use super::connector::Connector;
use super::error::ConnectorError;
use super::events::LifecycleEvent;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff between attempts on a busy line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    /// Upper bound for any delay
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Delay multiplier (exponential backoff)
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retry
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Calculate delay after `retry` failed retries (0 for the first one)
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f32() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f32());

        Duration::from_secs_f32(capped.max(0.0))
    }

    /// Whether attempt number `attempt` (1-based) is allowed
    pub fn should_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts.max(1)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Open a line, retrying while it is busy.
///
/// `factory` builds a fresh connector for attempt `n` (1-based); a failed
/// connector is closed before the next one is built. Only `DeviceBusy` is
/// retried; any other error is returned at once.
pub async fn open_with_busy_retry<F>(
    mut factory: F,
    policy: &RetryPolicy,
) -> Result<(Connector, Channel), ConnectorError>
where
    F: FnMut(u32) -> Connector,
{
    let mut attempt = 1;
    loop {
        let mut connector = factory(attempt);
        let err = match connector.open().await {
            Ok(channel) => return Ok((connector, channel)),
            Err(e) => e,
        };

        let holder = match &err {
            ConnectorError::DeviceBusy { holder, .. } if policy.should_attempt(attempt + 1) => {
                holder.clone()
            }
            _ => {
                connector.close().await;
                return Err(err);
            }
        };

        let delay = policy.delay_for_attempt(attempt - 1);
        tracing::info!(
            resource = %connector.resource(),
            "{} is busy (held by {}), retrying in {:?}",
            connector.resource(),
            holder,
            delay
        );
        connector.emit(LifecycleEvent::BusyRetry {
            attempt: attempt + 1,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            holder,
        });
        connector.close().await;

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
