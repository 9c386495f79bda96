//! Retry policy: decides whether a failed delivery goes back on the queue.

use tracing::error;

use super::{QueueSender, TryPushError};
use crate::domain::PublishMessage;

/// Default delivery attempts per message.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What happened to a message handed to `RetryPolicy::retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back on the queue for another attempt.
    Requeued,
    /// Attempt counter reached the ceiling; discarded.
    DroppedAtCeiling,
    /// Queue was full (or gone); discarded rather than blocking the worker.
    DroppedQueueFull,
}

/// Bounded re-enqueue with a per-message attempt counter.
///
/// A message is sent at most `max_attempts` times: every failure bumps the
/// counter first, and the message is dropped once the counter reaches the
/// ceiling. Drops are logged only; the caller already got `Ok` from publish.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Count one failed attempt. Returns `false` once the budget is spent.
    pub fn record_failure(&self, message: &mut PublishMessage) -> bool {
        message.attempts = message.attempts.saturating_add(1);
        message.attempts < self.max_attempts
    }

    /// Count a failure and requeue without waiting, or drop.
    pub fn retry(&self, mut message: PublishMessage, queue: &QueueSender) -> RetryOutcome {
        if !self.record_failure(&mut message) {
            error!(
                message_id = %message.id,
                exchange = %message.exchange,
                key = %message.routing_key,
                attempts = message.attempts,
                enqueued_at = %message.enqueued_at,
                age_ms = message.age_ms(),
                body = %message.body_lossy(),
                "Dropping message reaching max retries"
            );
            return RetryOutcome::DroppedAtCeiling;
        }

        match queue.try_push(message) {
            Ok(()) => RetryOutcome::Requeued,
            Err(TryPushError::Full(message) | TryPushError::Closed(message)) => {
                error!(
                    message_id = %message.id,
                    exchange = %message.exchange,
                    key = %message.routing_key,
                    attempts = message.attempts,
                    enqueued_at = %message.enqueued_at,
                    age_ms = message.age_ms(),
                    body = %message.body_lossy(),
                    "Failed to re-enqueue message"
                );
                RetryOutcome::DroppedQueueFull
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::publish_queue;
    use rstest::rstest;

    fn msg() -> PublishMessage {
        PublishMessage::new("events", "k", b"{}".to_vec())
    }

    #[test]
    fn default_policy_allows_three_attempts() {
        assert_eq!(RetryPolicy::default().max_attempts, 3);
    }

    #[rstest]
    #[case(1, 0, false)]
    #[case(2, 0, true)]
    #[case(2, 1, false)]
    #[case(3, 1, true)]
    #[case(3, 2, false)]
    fn budget_is_checked_after_increment(
        #[case] max_attempts: u32,
        #[case] prior_attempts: u32,
        #[case] keeps_going: bool,
    ) {
        let policy = RetryPolicy::new(max_attempts);
        let mut m = msg();
        m.attempts = prior_attempts;
        assert_eq!(policy.record_failure(&mut m), keeps_going);
        assert_eq!(m.attempts, prior_attempts + 1);
    }

    #[tokio::test]
    async fn requeues_below_ceiling() {
        let policy = RetryPolicy::new(3);
        let (tx, mut rx) = publish_queue(2);
        let original = msg();
        let (id, enqueued_at) = (original.id, original.enqueued_at);

        assert_eq!(policy.retry(original, &tx), RetryOutcome::Requeued);
        let requeued = rx.recv().await.unwrap();
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.id, id);
        assert_eq!(requeued.enqueued_at, enqueued_at);
    }

    #[tokio::test]
    async fn drops_at_ceiling_without_touching_queue() {
        let policy = RetryPolicy::new(2);
        let (tx, _rx) = publish_queue(2);
        let mut m = msg();
        m.attempts = 1;

        assert_eq!(policy.retry(m, &tx), RetryOutcome::DroppedAtCeiling);
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn drops_instead_of_blocking_on_full_queue() {
        let policy = RetryPolicy::new(3);
        let (tx, _rx) = publish_queue(1);
        tx.try_push(msg()).unwrap();

        assert_eq!(policy.retry(msg(), &tx), RetryOutcome::DroppedQueueFull);
        assert_eq!(tx.len(), 1);
    }
}
