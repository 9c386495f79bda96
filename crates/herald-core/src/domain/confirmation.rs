//! Delivery tags and broker confirmations.

use std::fmt;

/// Sequence number of a message within one connection epoch.
///
/// Starts at 1 on every new session and increases by one per successful
/// send, in send order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub const FIRST: DeliveryTag = DeliveryTag(1);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Publisher confirmation reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub tag: DeliveryTag,
    pub ack: bool,
}

impl Confirmation {
    pub fn ack(tag: DeliveryTag) -> Self {
        Self { tag, ack: true }
    }

    pub fn nack(tag: DeliveryTag) -> Self {
        Self { tag, ack: false }
    }
}
