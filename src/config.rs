//! Receiver configuration.

use crate::backpressure::BackpressureConfig;
use crate::cache::CacheConfig;
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recognized pipeline options.
///
/// Durations are written in milliseconds when loaded from JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReceiverConfig {
    /// Batches pulled per poll at steady state.
    pub target_batches_per_second: usize,

    /// Byte budget of the message cache.
    pub cache_size_bytes: usize,

    /// Minimum time an entry stays cached before size pressure may evict it.
    #[serde(with = "duration_ms")]
    pub data_min_time_in_cache: Duration,

    /// Age after which an entry is evicted regardless of size.
    #[serde(with = "duration_ms")]
    pub data_max_age_in_cache: Duration,

    /// Votes per regulator window (None = 10 × target rate).
    pub backpressure_window_size: Option<usize>,

    pub backpressure_low_threshold: f64,

    pub backpressure_high_threshold: f64,

    /// Period of the polling agent.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            target_batches_per_second: 10,
            cache_size_bytes: 64 * 1024 * 1024, // 64MB
            data_min_time_in_cache: Duration::from_secs(5 * 60),
            data_max_age_in_cache: Duration::from_secs(30 * 60),
            backpressure_window_size: None,
            backpressure_low_threshold: 0.005,
            backpressure_high_threshold: 0.02,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ReceiverConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_batches_per_second == 0 {
            return Err(StreamError::InvalidArgument(
                "target batches per second must be positive".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(StreamError::InvalidArgument(
                "poll interval must be positive".into(),
            ));
        }
        self.cache_config().validate()?;
        self.backpressure_config().validate()
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size_bytes: self.cache_size_bytes,
            data_min_time_in_cache: self.data_min_time_in_cache,
            data_max_age_in_cache: self.data_max_age_in_cache,
        }
    }

    pub fn backpressure_config(&self) -> BackpressureConfig {
        BackpressureConfig {
            window_size: self
                .backpressure_window_size
                .unwrap_or(10 * self.target_batches_per_second),
            low_threshold: self.backpressure_low_threshold,
            high_threshold: self.backpressure_high_threshold,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
