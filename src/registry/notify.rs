//! Producer-facing collaborators.

use crate::types::{ProducerId, StreamId, SubscriptionId};

use super::types::{Liveness, NotifyError, SubscriptionState};

/// Tells producers about subscribers coming and going.
///
/// Calls for different producers run concurrently; a call for one producer
/// must not depend on another.
pub trait ProducerNotifier: Send + Sync {
    fn add_subscriber(
        &self,
        producer: &ProducerId,
        subscription: &SubscriptionState,
    ) -> Result<(), NotifyError>;

    fn remove_subscriber(
        &self,
        producer: &ProducerId,
        stream: &StreamId,
        subscription: SubscriptionId,
    ) -> Result<(), NotifyError>;
}

/// Reports whether a producer is still hosted somewhere.
pub trait LivenessCheck: Send + Sync {
    fn is_alive(&self, producer: &ProducerId) -> Liveness;
}

impl<F> LivenessCheck for F
where
    F: Fn(&ProducerId) -> Liveness + Send + Sync,
{
    fn is_alive(&self, producer: &ProducerId) -> Liveness {
        self(producer)
    }
}
