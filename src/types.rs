//! Core identity and ordering types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier + namespace pair naming a logical event stream.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId {
    pub key: String,
    pub namespace: Option<String>,
}

impl StreamId {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Stream without a namespace.
    pub fn bare(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            namespace: None,
        }
    }

    /// Stable textual key, used to address durable state.
    ///
    /// The namespace is length-prefixed so that no two identities collide.
    pub fn storage_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}/{}", ns.len(), ns, self.key),
            None => format!("-/{}", self.key),
        }
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.key),
            None => write!(f, "{}", self.key),
        }
    }
}

/// Position of a batch (and of each event inside it) in the delivery order.
///
/// Ordered by `sequence_number`, ties broken by `event_index`. Field order
/// matters: the derived `Ord` compares fields top to bottom.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceToken {
    pub sequence_number: i64,
    pub event_index: i32,
}

impl SequenceToken {
    pub fn new(sequence_number: i64, event_index: i32) -> Self {
        Self {
            sequence_number,
            event_index,
        }
    }

    /// Token for the event at `index` within the same batch.
    pub fn for_event(self, index: i32) -> Self {
        debug_assert!(index >= 0, "event index must be non-negative");
        Self {
            sequence_number: self.sequence_number,
            event_index: index,
        }
    }

    /// First token of the following batch.
    pub fn next_batch(self) -> Self {
        Self {
            sequence_number: self.sequence_number + 1,
            event_index: 0,
        }
    }
}

impl fmt::Debug for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({}.{})", self.sequence_number, self.event_index)
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sequence_number, self.event_index)
    }
}

/// Caller-assigned identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Handle naming a stream producer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProducerId(pub String);

impl fmt::Debug for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProducerId({})", self.0)
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle naming the consumer that owns a subscription.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsumerId(pub String);

impl fmt::Debug for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsumerId({})", self.0)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}
