//! Batch container implementation.

use crate::error::{Result, StreamError};
use crate::types::{SequenceToken, StreamId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

use super::filter::EventFilter;

/// Fixed accounting overhead charged per cached batch (bytes).
pub const BATCH_OVERHEAD_BYTES: usize = 64;

/// Most events one batch can hold. Event indices within a token are `i32`.
pub const MAX_EVENTS_PER_BATCH: usize = i32::MAX as usize + 1;

/// Reject event counts whose indices would not fit a token.
pub(crate) fn check_event_count(count: usize) -> Result<()> {
    if count > MAX_EVENTS_PER_BATCH {
        return Err(StreamError::InvalidArgument(format!(
            "batch holds {} events, limit is {}",
            count, MAX_EVENTS_PER_BATCH
        )));
    }
    Ok(())
}

fn event_token(base: SequenceToken, index: usize) -> Option<SequenceToken> {
    i32::try_from(index).ok().map(|i| base.for_event(i))
}

/// Ordered events for a single stream, as pulled from the queue in one message.
#[derive(Clone, Debug)]
pub struct BatchContainer {
    /// Stream the events belong to.
    stream: StreamId,

    /// Token assigned by the receiver.
    token: SequenceToken,

    /// MessagePack-encoded event payloads, in order.
    events: Vec<Vec<u8>>,

    /// Context propagated from the producer alongside the events.
    request_context: HashMap<String, String>,
}

impl BatchContainer {
    /// Create a container for already-encoded events.
    pub fn new(stream: StreamId, token: SequenceToken, events: Vec<Vec<u8>>) -> Self {
        Self {
            stream,
            token,
            events,
            request_context: HashMap::new(),
        }
    }

    /// Attach producer request context.
    pub fn with_request_context(mut self, context: HashMap<String, String>) -> Self {
        self.request_context = context;
        self
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn token(&self) -> SequenceToken {
        self.token
    }

    pub fn request_context(&self) -> &HashMap<String, String> {
        &self.request_context
    }

    /// Number of events in the batch.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Bytes charged against the cache budget.
    pub fn size_bytes(&self) -> usize {
        let payload: usize = self.events.iter().map(Vec::len).sum();
        let context: usize = self
            .request_context
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        BATCH_OVERHEAD_BYTES + payload + context
    }

    /// Decode the events with their per-event tokens.
    ///
    /// The iterator is lazy and finite; calling `events` again starts over
    /// from the first event.
    pub fn events<T: DeserializeOwned>(
        &self,
    ) -> impl Iterator<Item = Result<(T, SequenceToken)>> + '_ {
        self.raw_events().map(|(bytes, token)| {
            let event: T = rmp_serde::from_slice(bytes)?;
            Ok((event, token))
        })
    }

    /// Raw payloads with their per-event tokens.
    ///
    /// Stops at [`MAX_EVENTS_PER_BATCH`]; the cache refuses larger batches.
    pub fn raw_events(&self) -> impl Iterator<Item = (&[u8], SequenceToken)> + '_ {
        let base = self.token;
        self.events
            .iter()
            .enumerate()
            .map_while(move |(i, bytes)| Some((bytes.as_slice(), event_token(base, i)?)))
    }

    /// True if this batch belongs to `stream` and passes `filter`.
    pub fn matches_filter(&self, stream: &StreamId, filter: &dyn EventFilter) -> bool {
        &self.stream == stream && filter.should_deliver(stream, self)
    }
}
