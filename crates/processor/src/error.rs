//! Error types for the stream processor
//!
//! Per-event failures (`DecodeError`) never leave a pipeline. Storage and
//! sink failures (`StateError`, `SinkError`) are retried by their callers.
//! Only `ProcessorError::Configuration` is fatal for the whole process.

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Payload decoding errors
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Window state and checkpoint errors
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Sink delivery errors
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Execution errors
    #[error("execution error: {source}")]
    Execution {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Kafka-related errors
    #[error("kafka error: {source}")]
    Kafka {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProcessorError {
    /// Shorthand for a configuration error with a plain message
    pub fn config(message: impl Into<String>) -> Self {
        ProcessorError::Configuration {
            source: message.into().into(),
        }
    }

    /// Whether this error must stop the whole process
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::Configuration { .. })
    }
}

/// Errors turning a raw message payload into a typed event
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Message had no payload at all
    #[error("empty payload")]
    EmptyPayload,

    /// Gzip stream could not be inflated
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),

    /// Decompressed payload exceeds the configured limit
    #[error("payload exceeds {limit} bytes after decompression")]
    PayloadTooLarge { limit: usize },

    /// Payload is not a valid event document
    #[error("invalid event JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Window state and checkpoint storage errors
#[derive(Error, Debug)]
pub enum StateError {
    /// State serialization failed
    #[error("state serialization failed for '{key}': {reason}")]
    SerializationFailed { key: String, reason: String },

    /// State deserialization failed
    #[error("state deserialization failed for '{key}': {reason}")]
    DeserializationFailed { key: String, reason: String },

    /// Checkpoint storage I/O error
    #[error("storage error in {backend_type}: {details}")]
    StorageError {
        backend_type: String,
        details: String,
    },

    /// Checkpoint creation failed
    #[error("checkpoint failed at {checkpoint_id}: {reason}")]
    CheckpointFailed {
        checkpoint_id: String,
        reason: String,
    },

    /// Checkpoint restoration failed
    #[error("restore failed from checkpoint {checkpoint_id}: {reason}")]
    RestoreFailed {
        checkpoint_id: String,
        reason: String,
    },
}

/// Errors publishing aggregated results
#[derive(Error, Debug)]
pub enum SinkError {
    /// Broker did not acknowledge the record
    #[error("delivery to '{topic}' failed: {reason}")]
    Delivery { topic: String, reason: String },

    /// Result could not be encoded
    #[error("result serialization failed: {0}")]
    Serialization(String),

    /// Sink was closed before the send
    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    /// Whether a later attempt can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Delivery { .. })
    }
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for decode operations
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Result type alias for state operations
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for ProcessorError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        ProcessorError::Kafka {
            source: Box::new(err),
        }
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}
