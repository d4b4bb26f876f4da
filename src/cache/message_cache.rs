//! Message cache implementation.

use crate::backpressure::BackpressureRegulator;
use crate::batch::{check_event_count, BatchContainer, EventFilter};
use crate::clock::Clock;
use crate::error::{Result, StreamError};
use crate::types::{SequenceToken, StreamId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::cursor::{Cursor, Position};

/// Cache configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for cached batches.
    pub max_size_bytes: usize,

    /// Entries younger than this are never evicted for size alone.
    pub data_min_time_in_cache: Duration,

    /// Entries older than this are evicted regardless of size.
    pub data_max_age_in_cache: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 64 * 1024 * 1024,
            data_min_time_in_cache: Duration::from_secs(5 * 60),
            data_max_age_in_cache: Duration::from_secs(30 * 60),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size_bytes == 0 {
            return Err(StreamError::InvalidArgument(
                "cache size must be positive".into(),
            ));
        }
        if self.data_max_age_in_cache.is_zero() {
            return Err(StreamError::InvalidArgument(
                "maximum cache age must be positive".into(),
            ));
        }
        if self.data_min_time_in_cache > self.data_max_age_in_cache {
            return Err(StreamError::InvalidArgument(format!(
                "minimum time in cache {:?} exceeds maximum age {:?}",
                self.data_min_time_in_cache, self.data_max_age_in_cache
            )));
        }
        Ok(())
    }
}

/// Result of adding a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    /// Entries evicted from the head by this add.
    pub evicted: usize,
    /// Cache size after the add.
    pub size_bytes: usize,
}

/// One cached batch.
pub(super) struct CachedBatch {
    pub(super) batch: Arc<BatchContainer>,
    size_bytes: usize,
    /// Total bytes appended before this entry (over the cache lifetime).
    appended_before: u64,
    enqueued_at: Instant,
}

/// Mutable cache contents, guarded by the shared lock.
pub(super) struct CacheState {
    pub(super) entries: VecDeque<CachedBatch>,
    /// Absolute index of `entries[0]`.
    pub(super) head_index: u64,
    size_bytes: usize,
    appended_bytes: u64,
    evicted_bytes: u64,
    /// Token of the most recently evicted entry.
    last_evicted: Option<SequenceToken>,
}

impl CacheState {
    pub(super) fn tail_index(&self) -> u64 {
        self.head_index + self.entries.len() as u64
    }

    pub(super) fn entry(&self, index: u64) -> Option<&CachedBatch> {
        index
            .checked_sub(self.head_index)
            .and_then(|offset| self.entries.get(offset as usize))
    }

    pub(super) fn oldest_token(&self) -> Option<SequenceToken> {
        self.entries.front().map(|e| e.batch.token())
    }

    fn newest_token(&self) -> Option<SequenceToken> {
        self.entries.back().map(|e| e.batch.token())
    }

    /// Absolute index of the first entry `>= token`.
    ///
    /// `Ok(None)` when no such entry exists yet. Fails when entries that may
    /// have been at or after `token` were already evicted.
    pub(super) fn resolve(&self, token: SequenceToken) -> Result<Option<u64>> {
        if matches!(self.last_evicted, Some(evicted) if token <= evicted) {
            return Err(StreamError::PositionNotInCache {
                requested: Some(token),
                oldest: self.oldest_token(),
            });
        }
        let offset = self.entries.partition_point(|e| e.batch.token() < token);
        if offset == self.entries.len() {
            Ok(None)
        } else {
            Ok(Some(self.head_index + offset as u64))
        }
    }

    /// Pressure on a reader positioned at `index`.
    ///
    /// Headroom is the free budget plus the bytes that must be evicted before
    /// the reader's next entry goes; pressure is the share of the budget
    /// that headroom does not cover.
    pub(super) fn pressure_at(&self, index: u64, max_size_bytes: usize) -> f64 {
        if index < self.head_index {
            return 1.0;
        }
        let older = match self.entry(index) {
            Some(entry) => entry.appended_before - self.evicted_bytes,
            None => self.size_bytes as u64,
        };
        let free = max_size_bytes.saturating_sub(self.size_bytes) as u64;
        let headroom = (free + older) as f64 / max_size_bytes as f64;
        (1.0 - headroom).clamp(0.0, 1.0)
    }
}

/// State shared between the cache handle and its cursors.
pub(super) struct CacheShared {
    pub(super) config: CacheConfig,
    pub(super) state: RwLock<CacheState>,
    pub(super) regulator: Arc<BackpressureRegulator>,
    clock: Arc<dyn Clock>,
}

/// Bounded, ordered cache of batches.
///
/// Cloning yields another handle to the same cache. Only one handle should
/// add (the receiver's poll loop); any number of cursors read concurrently.
#[derive(Clone)]
pub struct MessageCache {
    shared: Arc<CacheShared>,
}

impl MessageCache {
    /// Create a cache. Cursors report pressure to `regulator`.
    pub fn new(
        config: CacheConfig,
        regulator: Arc<BackpressureRegulator>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let state = CacheState {
            entries: VecDeque::new(),
            head_index: 0,
            size_bytes: 0,
            appended_bytes: 0,
            evicted_bytes: 0,
            last_evicted: None,
        };
        Ok(Self {
            shared: Arc::new(CacheShared {
                config,
                state: RwLock::new(state),
                regulator,
                clock,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Append a batch at the tail and apply the eviction policy.
    ///
    /// The batch token must be greater than every cached token.
    pub fn add(&self, batch: BatchContainer) -> Result<AddOutcome> {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.write();

        check_event_count(batch.event_count())?;
        let token = batch.token();
        if let Some(newest) = state.newest_token().or(state.last_evicted) {
            if token <= newest {
                return Err(StreamError::InvalidArgument(format!(
                    "batch token {} is not after cached token {}",
                    token, newest
                )));
            }
        }

        let size_bytes = batch.size_bytes();
        let appended_before = state.appended_bytes;
        state.entries.push_back(CachedBatch {
            batch: Arc::new(batch),
            size_bytes,
            appended_before,
            enqueued_at: now,
        });
        state.size_bytes += size_bytes;
        state.appended_bytes += size_bytes as u64;

        let evicted = self.evict(&mut state, now);
        Ok(AddOutcome {
            evicted,
            size_bytes: state.size_bytes,
        })
    }

    /// Apply the eviction policy without adding anything, so an idle cache
    /// still ages out. Returns the number of evicted entries.
    pub fn purge_expired(&self) -> usize {
        let now = self.shared.clock.now();
        let mut state = self.shared.state.write();
        self.evict(&mut state, now)
    }

    fn evict(&self, state: &mut CacheState, now: Instant) -> usize {
        let config = &self.shared.config;
        let mut evicted = 0;

        while let Some(front) = state.entries.front() {
            let age = now.saturating_duration_since(front.enqueued_at);
            let expired = age >= config.data_max_age_in_cache;
            let over_budget =
                state.size_bytes > config.max_size_bytes && age >= config.data_min_time_in_cache;
            if !expired && !over_budget {
                break;
            }

            let Some(entry) = state.entries.pop_front() else {
                break;
            };
            state.size_bytes -= entry.size_bytes;
            state.evicted_bytes += entry.size_bytes as u64;
            state.head_index += 1;
            state.last_evicted = Some(entry.batch.token());
            evicted += 1;
        }

        if evicted > 0 {
            debug!(
                evicted,
                size_bytes = state.size_bytes,
                oldest = ?state.oldest_token(),
                "evicted cached batches"
            );
        }
        evicted
    }

    /// Cursor positioned just before the first entry `>= token`.
    ///
    /// If that data has already been evicted the cursor is still returned;
    /// its first `move_next` fails with `PositionNotInCache`.
    pub fn get_cursor(
        &self,
        stream: StreamId,
        token: SequenceToken,
        filter: Option<Arc<dyn EventFilter>>,
    ) -> Cursor {
        Cursor::new(
            Arc::clone(&self.shared),
            stream,
            Position::Pending(token),
            filter,
        )
    }

    /// Cursor that only sees batches added after this call.
    pub fn latest_cursor(&self, stream: StreamId, filter: Option<Arc<dyn EventFilter>>) -> Cursor {
        let tail = self.shared.state.read().tail_index();
        Cursor::new(Arc::clone(&self.shared), stream, Position::Index(tail), filter)
    }

    /// Pressure on `cursor` in `[0, 1]`: 0 far from eviction, 1 at or past it.
    pub fn cursor_pressure(&self, cursor: &Cursor) -> f64 {
        cursor.pressure()
    }

    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently charged against the budget.
    pub fn size_bytes(&self) -> usize {
        self.shared.state.read().size_bytes
    }

    pub fn oldest_token(&self) -> Option<SequenceToken> {
        self.shared.state.read().oldest_token()
    }

    pub fn newest_token(&self) -> Option<SequenceToken> {
        self.shared.state.read().newest_token()
    }
}
