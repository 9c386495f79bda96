//! Delivery counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::queue::RetryOutcome;

/// Point-in-time copy of `DeliveryStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    /// Messages accepted by `publish`.
    pub accepted: u64,
    /// Successful transport sends (retries included).
    pub sent: u64,
    pub acked: u64,
    pub nacked: u64,
    pub requeued: u64,
    pub dropped_at_ceiling: u64,
    pub dropped_queue_full: u64,
    pub unknown_confirmations: u64,
    /// Sessions established.
    pub epochs: u64,
    /// Epochs that ended with a session error (failed connects included).
    pub session_failures: u64,
}

impl DeliveryCounts {
    pub fn dropped(&self) -> u64 {
        self.dropped_at_ceiling + self.dropped_queue_full
    }
}

/// Counters shared between the publish path and the worker.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    accepted: AtomicU64,
    sent: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    requeued: AtomicU64,
    dropped_at_ceiling: AtomicU64,
    dropped_queue_full: AtomicU64,
    unknown_confirmations: AtomicU64,
    epochs: AtomicU64,
    session_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DeliveryStats {
    pub fn record_accepted(&self) {
        bump(&self.accepted);
    }

    pub fn record_sent(&self) {
        bump(&self.sent);
    }

    pub fn record_confirmation(&self, ack: bool) {
        bump(if ack { &self.acked } else { &self.nacked });
    }

    pub fn record_unknown_confirmation(&self) {
        bump(&self.unknown_confirmations);
    }

    pub fn record_retry(&self, outcome: RetryOutcome) {
        bump(match outcome {
            RetryOutcome::Requeued => &self.requeued,
            RetryOutcome::DroppedAtCeiling => &self.dropped_at_ceiling,
            RetryOutcome::DroppedQueueFull => &self.dropped_queue_full,
        });
    }

    pub fn record_epoch(&self) {
        bump(&self.epochs);
    }

    pub fn record_session_failure(&self) {
        bump(&self.session_failures);
    }

    pub fn snapshot(&self) -> DeliveryCounts {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DeliveryCounts {
            accepted: get(&self.accepted),
            sent: get(&self.sent),
            acked: get(&self.acked),
            nacked: get(&self.nacked),
            requeued: get(&self.requeued),
            dropped_at_ceiling: get(&self.dropped_at_ceiling),
            dropped_queue_full: get(&self.dropped_queue_full),
            unknown_confirmations: get(&self.unknown_confirmations),
            epochs: get(&self.epochs),
            session_failures: get(&self.session_failures),
        }
    }
}
