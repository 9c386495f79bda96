//! Error types.
//!
//! Caller visible:
//! - `ProducerError`: construction (and worker faults surfaced on shutdown)
//! - `PublishError`: enqueueing a message
//!
//! Internal to the worker:
//! - `SessionError`: ends the current epoch, triggers a reconnect
//! - `InvariantViolation`: fatal, stops the worker

use thiserror::Error;

use super::confirmation::DeliveryTag;

/// Failure reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("session setup failed at {stage}: {reason}")]
    Setup { stage: &'static str, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("session closed by broker: {0}")]
    Closed(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Rejected configuration value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("queue_capacity must be at least 1")]
    ZeroCapacity,

    #[error("max_attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("publish_log_sample_rate must be within [0, 1], got {0}")]
    SampleRate(f64),
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("invalid producer configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("initial broker connection failed: {0}")]
    Connect(#[source] TransportError),

    #[error("publisher worker failed: {0}")]
    WorkerFault(String),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to marshal body to json: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("publish canceled by caller")]
    Canceled,

    #[error("publish deadline exceeded")]
    DeadlineExceeded,

    #[error("producer closed")]
    ProducerClosed,
}

/// Why a connection epoch ended.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("error setting up broker session: {0}")]
    Connect(#[source] TransportError),

    #[error("channel or connection closed: {}", close_reason(.0))]
    Closed(Option<TransportError>),

    #[error("confirmation stream closed")]
    ConfirmsClosed,

    #[error("error publishing message: {0}")]
    Publish(#[source] TransportError),
}

fn close_reason(reason: &Option<TransportError>) -> String {
    match reason {
        Some(err) => err.to_string(),
        None => "no reason given".to_string(),
    }
}

/// Worker state no longer matches its own bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("delivery tag {0} is already outstanding in this epoch")]
    DuplicateTag(DeliveryTag),
}
