//! Delivery filters.

use crate::types::StreamId;
use serde::{Deserialize, Serialize};

use super::container::BatchContainer;

/// Decides whether a batch should be delivered to a subscriber.
pub trait EventFilter: Send + Sync {
    fn should_deliver(&self, stream: &StreamId, batch: &BatchContainer) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&StreamId, &BatchContainer) -> bool + Send + Sync,
{
    fn should_deliver(&self, stream: &StreamId, batch: &BatchContainer) -> bool {
        self(stream, batch)
    }
}

/// Persistable filter attached to a subscription.
///
/// Unlike an arbitrary closure this can be stored in the registry's durable
/// snapshot and handed to producers when they learn about the subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFilter {
    /// Stream key starts with the prefix.
    KeyPrefix { prefix: String },
    /// Stream lives in the namespace.
    Namespace { namespace: String },
    /// Batch request context carries `key = value`.
    RequestContext { key: String, value: String },
    /// Batch holds at least this many events.
    MinEvents { count: usize },
}

impl SubscriptionFilter {
    pub fn key_prefix(prefix: impl Into<String>) -> Self {
        SubscriptionFilter::KeyPrefix {
            prefix: prefix.into(),
        }
    }

    pub fn namespace(namespace: impl Into<String>) -> Self {
        SubscriptionFilter::Namespace {
            namespace: namespace.into(),
        }
    }

    pub fn request_context(key: impl Into<String>, value: impl Into<String>) -> Self {
        SubscriptionFilter::RequestContext {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl EventFilter for SubscriptionFilter {
    fn should_deliver(&self, stream: &StreamId, batch: &BatchContainer) -> bool {
        match self {
            SubscriptionFilter::KeyPrefix { prefix } => stream.key.starts_with(prefix.as_str()),
            SubscriptionFilter::Namespace { namespace } => {
                stream.namespace.as_deref() == Some(namespace.as_str())
            }
            SubscriptionFilter::RequestContext { key, value } => {
                batch.request_context().get(key) == Some(value)
            }
            SubscriptionFilter::MinEvents { count } => batch.event_count() >= *count,
        }
    }
}
