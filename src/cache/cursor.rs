//! Per-subscription read cursor.

use crate::batch::{BatchContainer, EventFilter};
use crate::error::{Result, StreamError};
use crate::types::{SequenceToken, StreamId};
use std::sync::Arc;
use tracing::debug;

use super::message_cache::CacheShared;

/// Where a cursor will read next.
#[derive(Clone, Copy, Debug)]
pub(super) enum Position {
    /// Absolute cache index of the next entry to examine.
    Index(u64),
    /// Waiting for the first entry `>= token`; resolved on `move_next`.
    Pending(SequenceToken),
}

/// Iteration state of one subscriber over the shared cache.
///
/// A cursor is owned by its subscriber and never shared; dropping it ends the
/// subscription's view of the cache.
pub struct Cursor {
    cache: Arc<CacheShared>,
    stream: StreamId,
    filter: Option<Arc<dyn EventFilter>>,
    position: Position,
    current: Option<Arc<BatchContainer>>,
}

impl Cursor {
    pub(super) fn new(
        cache: Arc<CacheShared>,
        stream: StreamId,
        position: Position,
        filter: Option<Arc<dyn EventFilter>>,
    ) -> Self {
        Self {
            cache,
            stream,
            filter,
            position,
            current: None,
        }
    }

    /// Stream this cursor is bound to.
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Token of the last batch returned by `current`.
    pub fn last_delivered(&self) -> Option<SequenceToken> {
        self.current.as_ref().map(|b| b.token())
    }

    /// Advance to the next cached batch for this cursor's stream.
    ///
    /// Batches for other streams, or rejected by the filter, are skipped.
    /// Every examined entry reports a pressure sample to the regulator.
    /// Returns `Ok(false)` when nothing matches yet; the cursor stays where
    /// it is and can be polled again later.
    pub fn move_next(&mut self) -> Result<bool> {
        let state = self.cache.state.read();

        let mut index = match self.position {
            Position::Index(index) => index,
            Position::Pending(token) => match state.resolve(token)? {
                Some(index) => index,
                None => return Ok(false),
            },
        };

        if index < state.head_index {
            return Err(StreamError::PositionNotInCache {
                requested: self.last_delivered().map(SequenceToken::next_batch),
                oldest: state.oldest_token(),
            });
        }

        let max_size_bytes = self.cache.config.max_size_bytes;
        let tail = state.tail_index();
        while index < tail {
            let Some(entry) = state.entry(index) else {
                break;
            };
            self.cache
                .regulator
                .report_sample(state.pressure_at(index, max_size_bytes));
            index += 1;

            if self.matches(&entry.batch) {
                self.current = Some(Arc::clone(&entry.batch));
                self.position = Position::Index(index);
                return Ok(true);
            }
        }

        self.position = Position::Index(index);
        Ok(false)
    }

    /// The batch found by the last successful `move_next`.
    pub fn current(&self) -> Result<Arc<BatchContainer>> {
        self.current.clone().ok_or_else(|| {
            StreamError::InvalidArgument(format!(
                "cursor on {} has no current batch; call move_next first",
                self.stream
            ))
        })
    }

    fn matches(&self, batch: &BatchContainer) -> bool {
        match &self.filter {
            Some(filter) => batch.matches_filter(&self.stream, filter.as_ref()),
            None => batch.stream() == &self.stream,
        }
    }

    pub(super) fn pressure(&self) -> f64 {
        let state = self.cache.state.read();
        let index = match self.position {
            Position::Index(index) => index,
            Position::Pending(token) => match state.resolve(token) {
                Ok(Some(index)) => index,
                Ok(None) => return 0.0,
                Err(_) => return 1.0,
            },
        };
        state.pressure_at(index, self.cache.config.max_size_bytes)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        debug!(stream = %self.stream, last = ?self.last_delivered(), "cursor released");
    }
}

#[cfg(test)]
mod tests {
    use crate::backpressure::{BackpressureConfig, BackpressureRegulator};
    use crate::batch::{BatchContainer, EventFilter, SubscriptionFilter};
    use crate::cache::{CacheConfig, MessageCache};
    use crate::clock::ManualClock;
    use crate::error::StreamError;
    use crate::types::{SequenceToken, StreamId};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(max_size_bytes: usize, window: usize) -> (MessageCache, Arc<BackpressureRegulator>) {
        let regulator = Arc::new(
            BackpressureRegulator::new(BackpressureConfig {
                window_size: window,
                low_threshold: 0.1,
                high_threshold: 0.9,
            })
            .unwrap(),
        );
        let config = CacheConfig {
            max_size_bytes,
            data_min_time_in_cache: Duration::ZERO,
            data_max_age_in_cache: Duration::from_secs(600),
        };
        let cache =
            MessageCache::new(config, Arc::clone(&regulator), Arc::new(ManualClock::new())).unwrap();
        (cache, regulator)
    }

    fn batch(stream: &StreamId, seq: i64) -> BatchContainer {
        BatchContainer::new(stream.clone(), SequenceToken::new(seq, 0), vec![vec![1, 2, 3]])
    }

    #[test]
    fn test_cursor_on_empty_cache_sees_later_batches() {
        let (cache, _) = setup(100_000, 10);
        let stream = StreamId::new("ns", "a");
        let mut cursor = cache.get_cursor(stream.clone(), SequenceToken::new(1, 0), None);

        for seq in 1..=3 {
            cache.add(batch(&stream, seq)).unwrap();
        }

        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current().unwrap().token(), SequenceToken::new(1, 0));
        assert!(cursor.move_next().unwrap());
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.last_delivered(), Some(SequenceToken::new(3, 0)));
        assert!(!cursor.move_next().unwrap());
    }

    #[test]
    fn test_current_before_move_next_fails() {
        let (cache, _) = setup(100_000, 10);
        let cursor = cache.latest_cursor(StreamId::bare("a"), None);
        assert!(matches!(cursor.current(), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn test_skips_other_streams_and_resumes() {
        let (cache, _) = setup(100_000, 10);
        let a = StreamId::bare("a");
        let b = StreamId::bare("b");
        let mut cursor = cache.latest_cursor(a.clone(), None);

        cache.add(batch(&b, 1)).unwrap();
        cache.add(batch(&b, 2)).unwrap();
        assert!(!cursor.move_next().unwrap());

        cache.add(batch(&a, 3)).unwrap();
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current().unwrap().token(), SequenceToken::new(3, 0));
        assert!(!cursor.move_next().unwrap());
    }

    #[test]
    fn test_cursor_starts_at_first_token_at_or_after() {
        let (cache, _) = setup(100_000, 10);
        let stream = StreamId::bare("a");
        for seq in [2, 4, 6] {
            cache.add(batch(&stream, seq)).unwrap();
        }

        let mut cursor = cache.get_cursor(stream.clone(), SequenceToken::new(3, 0), None);
        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current().unwrap().token(), SequenceToken::new(4, 0));
    }

    #[test]
    fn test_evicted_position_reports_not_in_cache() {
        // Each batch is 67 bytes; room for two
        let (cache, _) = setup(150, 10);
        let stream = StreamId::bare("a");
        let mut cursor = cache.get_cursor(stream.clone(), SequenceToken::new(1, 0), None);

        for seq in 1..=4 {
            cache.add(batch(&stream, seq)).unwrap();
        }
        assert_eq!(cache.oldest_token(), Some(SequenceToken::new(3, 0)));

        let err = cursor.move_next().unwrap_err();
        assert!(err.is_position_not_in_cache());

        // Lagging cursor that had already read some data
        let mut reader = cache.get_cursor(stream.clone(), SequenceToken::new(3, 0), None);
        assert!(reader.move_next().unwrap());
        for seq in 5..=7 {
            cache.add(batch(&stream, seq)).unwrap();
        }
        match reader.move_next() {
            Err(StreamError::PositionNotInCache { requested, oldest }) => {
                assert_eq!(requested, Some(SequenceToken::new(4, 0)));
                assert_eq!(oldest, Some(SequenceToken::new(6, 0)));
            }
            other => panic!("expected PositionNotInCache, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_filter_applied_during_iteration() {
        let (cache, _) = setup(100_000, 10);
        let stream = StreamId::bare("a");
        let filter: Arc<dyn EventFilter> =
            Arc::new(SubscriptionFilter::request_context("priority", "high"));
        let mut cursor = cache.latest_cursor(stream.clone(), Some(filter));

        let mut high = HashMap::new();
        high.insert("priority".to_string(), "high".to_string());

        cache.add(batch(&stream, 1)).unwrap();
        cache
            .add(batch(&stream, 2).with_request_context(high))
            .unwrap();

        assert!(cursor.move_next().unwrap());
        assert_eq!(cursor.current().unwrap().token(), SequenceToken::new(2, 0));
        assert!(!cursor.move_next().unwrap());
    }

    #[test]
    fn test_every_examined_entry_votes() {
        let (cache, regulator) = setup(100_000, 3);
        let a = StreamId::bare("a");
        let b = StreamId::bare("b");
        let mut cursor = cache.latest_cursor(a.clone(), None);

        cache.add(batch(&b, 1)).unwrap();
        cache.add(batch(&b, 2)).unwrap();
        cache.add(batch(&a, 3)).unwrap();

        // Three entries examined -> one full window of near-zero pressure
        assert!(cursor.move_next().unwrap());
        assert!(regulator.should_increase());
    }
}
