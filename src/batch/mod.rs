//! Immutable delivery units and the filters applied to them.
//!
//! A [`BatchContainer`] carries the ordered events pulled for one stream in
//! one queue message, stamped with the [`SequenceToken`](crate::SequenceToken)
//! the receiver assigned. Containers are never mutated after they enter the
//! cache; cursors share them through `Arc`.

mod container;
mod filter;

pub(crate) use container::check_event_count;
pub use container::{BatchContainer, BATCH_OVERHEAD_BYTES, MAX_EVENTS_PER_BATCH};
pub use filter::{EventFilter, SubscriptionFilter};
