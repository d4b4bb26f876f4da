//! Queue collaborator interface and an in-process implementation.

use crate::batch::BatchContainer;
use crate::error::{Result, StreamError};
use crate::types::{SequenceToken, StreamId};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;
use std::collections::HashMap;

/// One message as delivered by the external queue: a batch of events for a
/// single stream, not yet ordered.
///
/// At most [`MAX_EVENTS_PER_BATCH`](crate::MAX_EVENTS_PER_BATCH) events are
/// accepted per message; the cache rejects anything larger.
#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub stream: StreamId,
    pub events: Vec<Vec<u8>>,
    pub request_context: HashMap<String, String>,
}

impl QueueMessage {
    pub fn new(stream: StreamId, events: Vec<Vec<u8>>) -> Self {
        Self {
            stream,
            events,
            request_context: HashMap::new(),
        }
    }

    /// Encode typed events with MessagePack.
    pub fn encode<T: Serialize>(stream: StreamId, events: &[T]) -> Result<Self> {
        let events = events
            .iter()
            .map(rmp_serde::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(stream, events))
    }

    pub fn with_request_context(mut self, context: HashMap<String, String>) -> Self {
        self.request_context = context;
        self
    }

    /// Stamp with an order token.
    pub fn into_batch(self, token: SequenceToken) -> BatchContainer {
        BatchContainer::new(self.stream, token, self.events)
            .with_request_context(self.request_context)
    }
}

/// External queue the receiver pulls from.
///
/// Implementations may return fewer than `max_batches`. Timeouts are the
/// implementation's business and surface as ordinary errors.
pub trait QueueSource: Send {
    fn pull(&mut self, max_batches: usize) -> Result<Vec<QueueMessage>>;
}

/// Unbounded in-process queue.
pub struct MemoryQueue {
    receiver: Receiver<QueueMessage>,
}

/// Writing side of a [`MemoryQueue`].
#[derive(Clone)]
pub struct MemoryQueueWriter {
    sender: Sender<QueueMessage>,
}

impl MemoryQueue {
    pub fn new() -> (Self, MemoryQueueWriter) {
        let (sender, receiver) = unbounded();
        (Self { receiver }, MemoryQueueWriter { sender })
    }

    /// Messages waiting to be pulled.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }
}

impl MemoryQueueWriter {
    pub fn send(&self, message: QueueMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|e| StreamError::collaborator("memory queue send", e))
    }
}

impl QueueSource for MemoryQueue {
    fn pull(&mut self, max_batches: usize) -> Result<Vec<QueueMessage>> {
        let mut pulled = Vec::with_capacity(max_batches.min(self.receiver.len()));
        while pulled.len() < max_batches {
            match self.receiver.try_recv() {
                Ok(message) => pulled.push(message),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        Ok(pulled)
    }
}
