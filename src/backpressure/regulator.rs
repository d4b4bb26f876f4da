//! Windowed voting regulator.

use crate::error::{Result, StreamError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Regulator tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Number of votes averaged before the state is re-evaluated.
    pub window_size: usize,

    /// Average at or below which the pull rate may increase.
    pub low_threshold: f64,

    /// Average at or above which the pull rate should decrease.
    pub high_threshold: f64,
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(StreamError::InvalidArgument(
                "backpressure window size must be positive".into(),
            ));
        }
        for (name, value) in [("low", self.low_threshold), ("high", self.high_threshold)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(StreamError::InvalidArgument(format!(
                    "backpressure {} threshold {} outside [0, 1]",
                    name, value
                )));
            }
        }
        if self.low_threshold > self.high_threshold {
            return Err(StreamError::InvalidArgument(format!(
                "backpressure low threshold {} above high threshold {}",
                self.low_threshold, self.high_threshold
            )));
        }
        Ok(())
    }
}

/// Decision published by the regulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PressureState {
    /// Consumers are far from eviction; pulling faster is safe.
    Low,
    /// Consumers are close to eviction; slow down.
    High,
    /// Hold the current rate.
    #[default]
    None,
}

/// Vote ring and the decision derived from it.
struct VoteRing {
    votes: Vec<f64>,
    index: usize,
    last_average: f64,
    state: PressureState,
}

/// Hysteretic speed-up / slow-down controller.
///
/// `report_sample` is called concurrently by every cursor; the decision
/// methods are called by the single poll loop.
pub struct BackpressureRegulator {
    config: BackpressureConfig,
    ring: Mutex<VoteRing>,
}

impl BackpressureRegulator {
    /// Create a regulator. Fails if the configuration is out of range.
    pub fn new(config: BackpressureConfig) -> Result<Self> {
        config.validate()?;
        let ring = VoteRing {
            votes: vec![0.0; config.window_size],
            index: 0,
            last_average: 0.0,
            state: PressureState::None,
        };
        Ok(Self {
            config,
            ring: Mutex::new(ring),
        })
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    /// Record one pressure vote.
    ///
    /// Values are clamped to `[0, 1]`; NaN is ignored. The state is only
    /// re-evaluated when the vote index wraps around the window.
    pub fn report_sample(&self, pressure: f64) {
        if pressure.is_nan() {
            return;
        }
        let pressure = pressure.clamp(0.0, 1.0);

        let mut ring = self.ring.lock();
        let slot = ring.index;
        ring.votes[slot] = pressure;
        ring.index = (slot + 1) % self.config.window_size;

        if ring.index == 0 {
            let average = ring.votes.iter().sum::<f64>() / self.config.window_size as f64;
            ring.last_average = average;
            ring.state = if average >= self.config.high_threshold {
                PressureState::High
            } else if average <= self.config.low_threshold {
                PressureState::Low
            } else {
                PressureState::None
            };
        }
    }

    pub fn should_increase(&self) -> bool {
        self.ring.lock().state == PressureState::Low
    }

    pub fn should_decrease(&self) -> bool {
        self.ring.lock().state == PressureState::High
    }

    /// Clear the decision without discarding vote history, so one window
    /// cannot drive two consecutive rate changes.
    pub fn reset(&self) {
        self.ring.lock().state = PressureState::None;
    }

    pub fn state(&self) -> PressureState {
        self.ring.lock().state
    }

    /// Mean of the most recent full window.
    pub fn last_average(&self) -> f64 {
        self.ring.lock().last_average
    }
}
