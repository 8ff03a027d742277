//! Tuning knobs for the engine and its execution backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// Deserializes with every field optional; missing fields take the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of task bodies running at once. Extra tasks queue.
    pub max_workers: usize,
    /// Capacity of the shared resource pool.
    pub pool_size: usize,
    /// Base delay for exponential back-off between retries.
    #[serde(with = "duration_millis")]
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            pool_size: 10,
            retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
