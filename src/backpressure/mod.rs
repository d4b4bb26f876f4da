//! Pull-rate regulation from cursor pressure.
//!
//! Every cursor step votes a pressure sample in `[0, 1]`. The
//! [`BackpressureRegulator`] only re-evaluates once a full window of votes has
//! been collected, and uses separate low/high thresholds so the poll loop sees
//! a stable speed-up / slow-down / hold signal rather than per-sample noise.

mod regulator;

pub use regulator::{BackpressureConfig, BackpressureRegulator, PressureState};
