//! Producer/consumer rendezvous.
//!
//! The registry keeps, per logical stream, the set of producers publishing to
//! it and the subscriptions consuming from it. Every mutation is persisted
//! through a [`SnapshotStore`] before it returns, and producers are told about
//! subscriptions appearing or disappearing through a [`ProducerNotifier`].
//!
//! Producers whose host is reported dead by the [`LivenessCheck`] are pruned
//! opportunistically; a producer with no verdict is kept. Once a stream has
//! neither producers nor consumers its durable state is cleared.

mod manager;
mod notify;
mod storage;
mod types;

pub use manager::SubscriptionRegistry;
pub use notify::{LivenessCheck, ProducerNotifier};
pub use storage::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use types::{
    Liveness, NotifyError, ProducerKey, ProducerState, StreamActivity, StreamSnapshot,
    SubscriptionKey, SubscriptionState,
};
