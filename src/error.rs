//! Error types for the stream pipeline.

use crate::types::{ProducerId, SequenceToken, StreamId, SubscriptionId};
use thiserror::Error;

/// Main error type for pipeline and registry operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Producer {producer} is not active (stream {stream})")]
    InvalidProducer {
        stream: StreamId,
        producer: ProducerId,
    },

    #[error("Subscription {subscription} on stream {stream} is faulted")]
    FaultedSubscription {
        stream: StreamId,
        subscription: SubscriptionId,
    },

    /// The cursor points at data that has already been evicted. The caller
    /// must resubscribe from a valid point; the gap is never skipped silently.
    #[error("Position {requested:?} is no longer in cache (oldest retained: {oldest:?})")]
    PositionNotInCache {
        requested: Option<SequenceToken>,
        oldest: Option<SequenceToken>,
    },

    #[error("{context}: {message}")]
    Collaborator { context: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Snapshot directory is locked by another process")]
    Locked,
}

impl StreamError {
    /// Build a collaborator failure with context.
    pub fn collaborator(context: impl Into<String>, message: impl ToString) -> Self {
        StreamError::Collaborator {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// True when the caller should resubscribe from a position still in cache.
    pub fn is_position_not_in_cache(&self) -> bool {
        matches!(self, StreamError::PositionNotInCache { .. })
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StreamError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StreamError::Deserialization(e.to_string())
    }
}

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;
