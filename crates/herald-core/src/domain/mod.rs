//! Domain model (ids, messages, confirmations, errors).

pub mod confirmation;
pub mod errors;
pub mod ids;
pub mod message;

pub use confirmation::{Confirmation, DeliveryTag};
pub use errors::{
    ConfigError, InvariantViolation, ProducerError, PublishError, SessionError, TransportError,
};
pub use ids::MessageId;
pub use message::{
    DEFAULT_PRIORITY, DeliveryMode, JSON_CONTENT_TYPE, MessageProperties, PublishMessage,
    namespaced_key,
};
