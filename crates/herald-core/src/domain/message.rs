//! The unit of work that flows through queue, tracker and retry policy.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::ids::MessageId;

/// Content type of every body produced by `Producer::publish`.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Priority stamped on every message.
pub const DEFAULT_PRIORITY: u8 = 1;

/// Broker-side persistence of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Kept in memory only (AMQP delivery-mode 1).
    #[default]
    Transient,
    /// Written to disk by the broker (AMQP delivery-mode 2).
    Persistent,
}

impl DeliveryMode {
    /// Wire value used by AMQP 0-9-1.
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Properties sent alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub priority: u8,
    pub headers: BTreeMap<String, String>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: DeliveryMode::Transient,
            priority: DEFAULT_PRIORITY,
            headers: BTreeMap::new(),
        }
    }
}

/// One message on its way to the broker.
///
/// Ownership moves queue -> worker -> tracker -> (queue again on retry).
/// The message is dropped once acked or once `attempts` reaches the ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub id: MessageId,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,

    /// Failed delivery attempts so far. Only the worker touches this.
    pub attempts: u32,

    /// Set once by `Producer::publish`; retries keep it.
    pub enqueued_at: DateTime<Utc>,
}

impl PublishMessage {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: MessageId::generate(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            properties: MessageProperties::default(),
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Time spent in the producer as of `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.enqueued_at
    }

    /// Milliseconds since the message was accepted, for logs.
    pub fn age_ms(&self) -> i64 {
        self.age_at(Utc::now()).num_milliseconds()
    }

    /// Body rendered for logs. Non UTF-8 bytes are replaced.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Final routing key: `namespace.key` when a namespace is configured.
pub fn namespaced_key(namespace: Option<&str>, key: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{ns}.{key}"),
        _ => key.to_string(),
    }
}
