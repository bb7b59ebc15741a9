//! Client tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{MAX_BATCH_GET_ITEMS, MAX_BATCH_WRITE_ITEMS};

/// Upper bound for the batch retry backoff.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Configuration shared by every operation of a [`Client`](crate::Client).
///
/// Deserializes from JSON with every field optional:
///
/// ```
/// use ferridyn_mapper::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(r#"{"max_batch_retries": 2}"#).unwrap();
/// assert_eq!(config.max_batch_retries, 2);
/// assert_eq!(config.batch_write_size, 25);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Items per batch-write request.
    pub batch_write_size: usize,
    /// Keys per batch-get request.
    pub batch_get_size: usize,
    /// Consecutive rounds without progress before a batch gives up.
    pub max_batch_retries: usize,
    /// Initial delay between no-progress rounds; doubled each time.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    /// Delay between stream polls in `wait_next`.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Expired shard iterators refreshed per shard before giving up.
    pub max_iterator_refreshes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_write_size: MAX_BATCH_WRITE_ITEMS,
            batch_get_size: MAX_BATCH_GET_ITEMS,
            max_batch_retries: 8,
            retry_backoff: Duration::from_millis(50),
            poll_interval: Duration::from_millis(200),
            max_iterator_refreshes: 3,
        }
    }
}

impl ClientConfig {
    pub fn with_batch_write_size(mut self, n: usize) -> Self {
        self.batch_write_size = n.clamp(1, MAX_BATCH_WRITE_ITEMS);
        self
    }

    pub fn with_batch_get_size(mut self, n: usize) -> Self {
        self.batch_get_size = n.clamp(1, MAX_BATCH_GET_ITEMS);
        self
    }

    pub fn with_max_batch_retries(mut self, n: usize) -> Self {
        self.max_batch_retries = n;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_iterator_refreshes(mut self, n: usize) -> Self {
        self.max_iterator_refreshes = n;
        self
    }

    /// Backoff before retry number `attempt` (1-based).
    pub(crate) fn backoff_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(16) as u32;
        self.retry_backoff
            .saturating_mul(1 << shift)
            .min(MAX_RETRY_BACKOFF)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
