//! Outstanding deliveries of one connection epoch.

use std::collections::HashMap;

use crate::domain::{DeliveryTag, InvariantViolation, PublishMessage};

/// Sent-but-unconfirmed messages keyed by delivery tag.
///
/// Design:
/// - One tracker per epoch; a new session starts a new tracker at tag 1.
/// - Tags are handed out in the order messages are recorded, which is the
///   order they were sent to the transport.
/// - Only the worker owns it, so there is no locking.
#[derive(Debug)]
pub struct DeliveryTracker {
    next_tag: DeliveryTag,
    outstanding: HashMap<DeliveryTag, PublishMessage>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self {
            next_tag: DeliveryTag::FIRST,
            outstanding: HashMap::new(),
        }
    }

    /// Store a message that was just sent and return its tag.
    pub fn record(&mut self, message: PublishMessage) -> Result<DeliveryTag, InvariantViolation> {
        let tag = self.next_tag;
        if self.outstanding.contains_key(&tag) {
            return Err(InvariantViolation::DuplicateTag(tag));
        }
        self.outstanding.insert(tag, message);
        self.next_tag = tag.next();
        Ok(tag)
    }

    /// Remove and return the message confirmed by `tag`, if known.
    pub fn resolve(&mut self, tag: DeliveryTag) -> Option<PublishMessage> {
        self.outstanding.remove(&tag)
    }

    /// Take every outstanding message in tag order, leaving the tracker empty.
    pub fn drain(&mut self) -> Vec<PublishMessage> {
        let mut entries: Vec<_> = self.outstanding.drain().collect();
        entries.sort_unstable_by_key(|(tag, _)| *tag);
        entries.into_iter().map(|(_, msg)| msg).collect()
    }

    /// Tag the next recorded message will receive.
    pub fn next_tag(&self) -> DeliveryTag {
        self.next_tag
    }

    pub fn len(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}
