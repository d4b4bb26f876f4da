//! Bounded in-memory cache of batches with independent read cursors.
//!
//! The cache is an append-at-tail, evict-from-head sequence of
//! [`BatchContainer`](crate::BatchContainer)s ordered by token. Entries are
//! addressed by an absolute index that never gets reused, so a cursor whose
//! position has been evicted can always tell, and reports
//! [`StreamError::PositionNotInCache`](crate::StreamError::PositionNotInCache)
//! instead of reading something else.
//!
//! Eviction policy:
//! - entries older than `data_max_age_in_cache` are evicted regardless of size
//! - while over `max_size_bytes`, the head is evicted once it is at least
//!   `data_min_time_in_cache` old
//!
//! # Example
//!
//! ```ignore
//! let cache = MessageCache::new(CacheConfig::default(), regulator, Arc::new(SystemClock))?;
//! let mut cursor = cache.get_cursor(stream.clone(), SequenceToken::new(1, 0), None);
//!
//! cache.add(batch)?;
//! while cursor.move_next()? {
//!     let batch = cursor.current()?;
//!     deliver(&batch);
//! }
//! ```

mod cursor;
mod message_cache;

pub use cursor::Cursor;
pub use message_cache::{AddOutcome, CacheConfig, MessageCache};
