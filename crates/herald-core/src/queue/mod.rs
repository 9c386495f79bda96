//! Publish queue, delivery tracker and retry policy.
//!
//! The queue is the only synchronization point between callers and the
//! worker:
//! - fresh publishes wait for space, racing an interrupt (cancel/deadline/shutdown)
//! - retries never wait; a full queue rejects them immediately

mod retry;
mod tracker;

pub use retry::{DEFAULT_MAX_ATTEMPTS, RetryOutcome, RetryPolicy};
pub use tracker::DeliveryTracker;

use std::future::Future;

use tokio::sync::mpsc;

use crate::domain::PublishMessage;

/// Default number of buffered messages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Why a blocking push did not enqueue.
#[derive(Debug, PartialEq, Eq)]
pub enum PushError<E> {
    /// The interrupt future resolved first.
    Interrupted(E),
    /// The receiving side is gone.
    Closed,
}

/// Why a non-blocking push did not enqueue. The message is handed back.
#[derive(Debug)]
pub enum TryPushError {
    Full(PublishMessage),
    Closed(PublishMessage),
}

/// Producer-side handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<PublishMessage>,
}

/// Worker-side handle. Exactly one exists per queue.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<PublishMessage>,
}

/// Create a bounded queue holding at most `capacity` messages.
pub fn publish_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (QueueSender { tx }, QueueReceiver { rx })
}

impl QueueSender {
    /// Wait for a free slot unless `interrupt` resolves first.
    ///
    /// Waiting happens on a slot reservation, so losing the race never
    /// leaves a half-sent message behind.
    pub async fn push_or<F, E>(&self, message: PublishMessage, interrupt: F) -> Result<(), PushError<E>>
    where
        F: Future<Output = E>,
    {
        tokio::select! {
            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(message);
                    Ok(())
                }
                Err(_) => Err(PushError::Closed),
            },
            reason = interrupt => Err(PushError::Interrupted(reason)),
        }
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, message: PublishMessage) -> Result<(), TryPushError> {
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(m) => TryPushError::Full(m),
            mpsc::error::TrySendError::Closed(m) => TryPushError::Closed(m),
        })
    }

    /// Messages currently buffered.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl QueueReceiver {
    /// Next message in FIFO order. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<PublishMessage> {
        self.rx.recv().await
    }
}
