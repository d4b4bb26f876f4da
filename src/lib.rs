//! # Stream Relay
//!
//! A queue-to-subscriber delivery pipeline for logical event streams, plus
//! the producer/consumer rendezvous that keeps both sides connected.
//!
//! ## Core Concepts
//!
//! - **Batches**: Immutable groups of events for one stream, ordered by token
//! - **Cache**: Bounded in-memory window of batches with per-subscriber cursors
//! - **Backpressure**: Windowed cursor-pressure votes that steer the pull rate
//! - **Receiver**: Pulls from a queue, stamps tokens, fills the cache
//! - **Registry**: Durable producer/subscription rendezvous per stream
//!
//! ## Example
//!
//! ```ignore
//! use stream_relay::{MemoryQueue, QueueMessage, QueueReceiver, ReceiverConfig, StreamId};
//!
//! let (queue, writer) = MemoryQueue::new();
//! let mut receiver = QueueReceiver::new(&ReceiverConfig::default(), Box::new(queue))?;
//!
//! let stream = StreamId::new("orders", "eu-1");
//! let mut cursor = receiver.create_cursor(stream.clone(), None, None);
//!
//! writer.send(QueueMessage::encode(stream, &["created", "paid"])?)?;
//! receiver.poll();
//!
//! while cursor.move_next()? {
//!     for event in cursor.current()?.events::<String>() {
//!         let (payload, token) = event?;
//!         println!("{token}: {payload}");
//!     }
//! }
//! ```

pub mod backpressure;
pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod receiver;
pub mod registry;
pub mod types;

// Re-exports
pub use backpressure::{BackpressureConfig, BackpressureRegulator, PressureState};
pub use batch::{BatchContainer, EventFilter, SubscriptionFilter, MAX_EVENTS_PER_BATCH};
pub use cache::{AddOutcome, CacheConfig, Cursor, MessageCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ReceiverConfig;
pub use error::{Result, StreamError};
pub use receiver::{
    MemoryQueue, MemoryQueueWriter, PollReport, PollingAgent, QueueMessage, QueueReceiver,
    QueueSource, RateChange,
};
pub use registry::{
    FileSnapshotStore, LivenessCheck, Liveness, MemorySnapshotStore, NotifyError,
    ProducerNotifier, SnapshotStore, StreamActivity, StreamSnapshot, SubscriptionRegistry,
    SubscriptionState,
};
pub use types::*;
