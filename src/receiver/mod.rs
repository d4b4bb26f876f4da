//! Queue ingestion.
//!
//! The [`QueueReceiver`] pulls batches from a [`QueueSource`] at a rate set by
//! the backpressure regulator, stamps each batch with the next
//! [`SequenceToken`](crate::SequenceToken), and appends it to the
//! [`MessageCache`](crate::MessageCache). Subscribers attach through
//! [`QueueReceiver::create_cursor`].
//!
//! `poll` must never run concurrently with itself. Either call it from a
//! single timer of your own, or hand the receiver to a [`PollingAgent`],
//! which runs it on a dedicated thread at a fixed period.

mod agent;
mod ingest;
mod queue;

pub use agent::PollingAgent;
pub use ingest::{PollReport, QueueReceiver, RateChange};
pub use queue::{MemoryQueue, MemoryQueueWriter, QueueMessage, QueueSource};
