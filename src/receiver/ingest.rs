//! Adaptive-rate queue receiver.

use crate::backpressure::BackpressureRegulator;
use crate::batch::EventFilter;
use crate::cache::{Cursor, MessageCache};
use crate::clock::{Clock, SystemClock};
use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::types::{SequenceToken, StreamId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::queue::QueueSource;

/// Rate adjustment made at the start of a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateChange {
    Increased,
    Decreased,
}

/// What one poll did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollReport {
    /// Batches asked of the queue.
    pub requested: usize,
    /// Batches received and cached.
    pub received: usize,
    /// Cache entries evicted during this poll.
    pub evicted: usize,
    /// Rate in effect after this poll.
    pub target_rate: usize,
    pub rate_change: Option<RateChange>,
    /// The pull failed; nothing was received this interval.
    pub pull_failed: bool,
}

/// Pulls batches from a queue into the message cache.
pub struct QueueReceiver {
    source: Box<dyn QueueSource>,
    cache: MessageCache,
    regulator: Arc<BackpressureRegulator>,
    configured_target: usize,
    target_rate: usize,
    next_sequence_number: i64,
}

impl QueueReceiver {
    /// Create a receiver using the system clock.
    pub fn new(config: &ReceiverConfig, source: Box<dyn QueueSource>) -> Result<Self> {
        Self::with_clock(config, source, Arc::new(SystemClock))
    }

    /// Create a receiver with an explicit clock for cache ages.
    pub fn with_clock(
        config: &ReceiverConfig,
        source: Box<dyn QueueSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let regulator = Arc::new(BackpressureRegulator::new(config.backpressure_config())?);
        let cache = MessageCache::new(config.cache_config(), Arc::clone(&regulator), clock)?;

        Ok(Self {
            source,
            cache,
            regulator,
            configured_target: config.target_batches_per_second,
            target_rate: config.target_batches_per_second,
            next_sequence_number: 1,
        })
    }

    /// Adjust the rate, pull up to `target_rate` batches, and cache them.
    ///
    /// A failed pull yields an empty interval; the next poll tries again.
    pub fn poll(&mut self) -> PollReport {
        let rate_change = self.adjust_rate();
        let requested = self.target_rate;

        let (messages, pull_failed) = match self.source.pull(requested) {
            Ok(messages) => (messages, false),
            Err(e) => {
                warn!(error = %e, requested, "queue pull failed");
                (Vec::new(), true)
            }
        };

        let mut received = 0;
        let mut evicted = 0;
        for message in messages {
            let token = SequenceToken::new(self.next_sequence_number, 0);
            self.next_sequence_number += 1;

            match self.cache.add(message.into_batch(token)) {
                Ok(outcome) => {
                    received += 1;
                    evicted += outcome.evicted;
                }
                Err(e) => warn!(error = %e, %token, "dropping batch rejected by cache"),
            }
        }
        evicted += self.cache.purge_expired();

        debug!(
            requested,
            received,
            evicted,
            target_rate = self.target_rate,
            cached = self.cache.len(),
            "poll complete"
        );

        PollReport {
            requested,
            received,
            evicted,
            target_rate: self.target_rate,
            rate_change,
            pull_failed,
        }
    }

    /// One step towards the regulator's decision, bounded to
    /// `[1, 2 × configured target]`.
    fn adjust_rate(&mut self) -> Option<RateChange> {
        if self.regulator.should_increase() && self.target_rate < 2 * self.configured_target {
            self.target_rate += 1;
            self.regulator.reset();
            info!(target_rate = self.target_rate, "increasing pull rate");
            Some(RateChange::Increased)
        } else if self.regulator.should_decrease() && self.target_rate > 1 {
            self.target_rate -= 1;
            self.regulator.reset();
            info!(target_rate = self.target_rate, "decreasing pull rate");
            Some(RateChange::Decreased)
        } else {
            None
        }
    }

    /// Attach a subscriber.
    ///
    /// With no token the cursor only sees data added from now on; otherwise
    /// it starts at the first cached batch at or after `token`.
    pub fn create_cursor(
        &self,
        stream: StreamId,
        token: Option<SequenceToken>,
        filter: Option<Arc<dyn EventFilter>>,
    ) -> Cursor {
        cursor_for(&self.cache, stream, token, filter)
    }

    /// Shared handle to the cache.
    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    pub fn regulator(&self) -> &Arc<BackpressureRegulator> {
        &self.regulator
    }

    pub fn target_rate(&self) -> usize {
        self.target_rate
    }

    /// Sequence number the next pulled batch will get.
    pub fn next_sequence_number(&self) -> i64 {
        self.next_sequence_number
    }
}

pub(super) fn cursor_for(
    cache: &MessageCache,
    stream: StreamId,
    token: Option<SequenceToken>,
    filter: Option<Arc<dyn EventFilter>>,
) -> Cursor {
    match token {
        Some(token) => cache.get_cursor(stream, token, filter),
        None => cache.latest_cursor(stream, filter),
    }
}
