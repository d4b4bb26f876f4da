//! Rendezvous state and collaborator types.

use crate::batch::SubscriptionFilter;
use crate::types::{ConsumerId, ProducerId, StreamId, SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Composite key of a producer registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducerKey {
    pub stream: StreamId,
    pub producer: ProducerId,
}

/// Composite key of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub stream: StreamId,
    pub subscription: SubscriptionId,
}

/// A registered producer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerState {
    pub stream: StreamId,
    pub producer: ProducerId,
    pub registered_at: Timestamp,
}

/// A registered subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub subscription_id: SubscriptionId,
    pub stream: StreamId,
    pub consumer: ConsumerId,
    pub filter: Option<SubscriptionFilter>,
    /// Terminal: a faulted subscription never becomes active again.
    pub faulted: bool,
    pub created_at: Timestamp,
}

/// Durable rendezvous state of one stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub producers: HashMap<ProducerKey, ProducerState>,
    pub consumers: HashMap<SubscriptionKey, SubscriptionState>,
}

impl StreamSnapshot {
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.consumers.is_empty()
    }

    /// Subscriptions that have not faulted.
    pub fn active_subscriptions(&self) -> impl Iterator<Item = &SubscriptionState> + '_ {
        self.consumers.values().filter(|s| !s.faulted)
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.values().map(|p| p.producer.clone()).collect()
    }
}

/// Whether a stream still has registrations after a removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamActivity {
    Active,
    /// No producers and no consumers remain; durable state was cleared.
    Idle,
}

/// Answer of the liveness collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Permanently gone; safe to prune.
    Dead,
    /// Membership has no verdict. Never treated as dead.
    Unknown,
}

/// Failure reported by a producer notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    /// The producer no longer exists and should be pruned.
    #[error("producer is gone")]
    Gone,

    #[error("notification failed: {0}")]
    Failed(String),
}
