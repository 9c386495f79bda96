//! Supervisor - the background publisher loop.
//!
//! # Flow
//! 1. Open a session through the `Transport` (one connection epoch).
//! 2. Multiplex shutdown, session close, queued messages and confirmations
//!    until the epoch ends.
//! 3. Resubmit everything still unconfirmed through the retry policy.
//! 4. Unless the producer is shutting down, wait out the reconnect delay and
//!    go back to 1.
//!
//! All session state (tag counter, tracker) lives on this task only.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::status::DeliveryStats;
use crate::domain::{Confirmation, InvariantViolation, PublishMessage, SessionError};
use crate::ports::{Endpoint, Session, SessionEvents, Transport, session_channels};
use crate::queue::{DeliveryTracker, QueueReceiver, QueueSender, RetryPolicy};

/// How one epoch ended.
#[derive(Debug)]
enum EpochEnd {
    /// Producer lifetime is over; do not reconnect.
    Shutdown,
    /// Session is unusable; reconnect after the delay.
    Failed(SessionError),
}

pub(crate) struct Supervisor {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) endpoint: Endpoint,
    pub(crate) queue: QueueReceiver,
    pub(crate) requeue: QueueSender,
    pub(crate) retry: RetryPolicy,
    pub(crate) reconnect_delay: Duration,
    pub(crate) confirm_capacity: usize,
    pub(crate) log_sample_rate: f64,
    pub(crate) lifetime: CancellationToken,
    pub(crate) stats: Arc<DeliveryStats>,
}

impl Supervisor {
    /// Run on its own task. However the worker exits (fault and panic
    /// included) the producer lifetime is cancelled, so blocked publishers
    /// are released. Faults come back through the handle.
    pub(crate) fn spawn(self) -> JoinHandle<Result<(), InvariantViolation>> {
        let lifetime = self.lifetime.clone();
        tokio::spawn(async move {
            let _stop_producer = lifetime.clone().drop_guard();
            let result = self.run().await;
            if let Err(fault) = &result {
                error!(error = %fault, "Background publisher stopped on an internal fault");
            }
            result
        })
    }

    pub(crate) async fn run(mut self) -> Result<(), InvariantViolation> {
        let mut epoch: u64 = 0;
        loop {
            // The delay is a minimum spacing between connect attempts.
            let retry_at = Instant::now() + self.reconnect_delay;
            epoch += 1;

            let err = match self.run_epoch(epoch).await? {
                EpochEnd::Shutdown => {
                    info!(epoch, "Background publisher stopped");
                    return Ok(());
                }
                EpochEnd::Failed(err) => err,
            };
            if self.lifetime.is_cancelled() {
                return Ok(());
            }
            self.stats.record_session_failure();
            warn!(epoch, error = %err, "Broker session ended");

            tokio::select! {
                _ = self.lifetime.cancelled() => {
                    info!(epoch, "Background publisher stopped while waiting to reconnect");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(retry_at) => {}
            }
            error!(epoch, error = %err, "Recovering broker connection");
        }
    }

    async fn run_epoch(&mut self, epoch: u64) -> Result<EpochEnd, InvariantViolation> {
        // Cancelled when this function returns, which tears the session down.
        let scope = self.lifetime.child_token();
        let _scope_guard = scope.clone().drop_guard();

        let (sinks, mut events) = session_channels(self.confirm_capacity);
        let connected = tokio::select! {
            _ = self.lifetime.cancelled() => return Ok(EpochEnd::Shutdown),
            res = self.transport.connect(scope, &self.endpoint, Some(sinks)) => res,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(err) => return Ok(EpochEnd::Failed(SessionError::Connect(err))),
        };
        self.stats.record_epoch();
        info!(epoch, uri = %self.endpoint.uri, exchange = %self.endpoint.exchange, "Broker session established");

        let mut tracker = DeliveryTracker::new();
        let end = self
            .pump(epoch, session.as_mut(), &mut events, &mut tracker)
            .await?;

        match &end {
            EpochEnd::Failed(_) => {
                let outstanding = tracker.drain();
                if let Some(oldest) = outstanding.iter().map(|m| m.enqueued_at).min() {
                    warn!(
                        epoch,
                        count = outstanding.len(),
                        oldest_enqueued_at = %oldest,
                        "Resubmitting unconfirmed messages"
                    );
                }
                for message in outstanding {
                    self.retry(message);
                }
            }
            EpochEnd::Shutdown => {
                if !tracker.is_empty() {
                    warn!(epoch, count = tracker.len(), "Shutting down with unconfirmed messages");
                }
            }
        }
        Ok(end)
    }

    /// Per-epoch event loop.
    async fn pump(
        &mut self,
        epoch: u64,
        session: &mut dyn Session,
        events: &mut SessionEvents,
        tracker: &mut DeliveryTracker,
    ) -> Result<EpochEnd, InvariantViolation> {
        loop {
            tokio::select! {
                _ = self.lifetime.cancelled() => return Ok(EpochEnd::Shutdown),

                closed = &mut events.closed => {
                    return Ok(EpochEnd::Failed(SessionError::Closed(closed.ok())));
                }

                next = self.queue.recv() => {
                    let Some(message) = next else {
                        return Ok(EpochEnd::Shutdown);
                    };
                    if let Some(end) = self.send(epoch, session, tracker, message).await? {
                        return Ok(end);
                    }
                }

                confirmation = events.confirms.recv() => match confirmation {
                    Some(confirmation) => self.confirm(epoch, tracker, confirmation),
                    None => return Ok(EpochEnd::Failed(SessionError::ConfirmsClosed)),
                },
            }
        }
    }

    /// Publish one message. Returns an epoch end when the session is unusable.
    async fn send(
        &mut self,
        epoch: u64,
        session: &mut dyn Session,
        tracker: &mut DeliveryTracker,
        message: PublishMessage,
    ) -> Result<Option<EpochEnd>, InvariantViolation> {
        let published = tokio::select! {
            _ = self.lifetime.cancelled() => {
                warn!(epoch, message_id = %message.id, "Shutdown interrupted an in-flight publish");
                return Ok(Some(EpochEnd::Shutdown));
            }
            res = session.publish(&message.exchange, &message.routing_key, &message) => res,
        };

        if let Err(err) = published {
            error!(
                epoch,
                message_id = %message.id,
                exchange = %message.exchange,
                key = %message.routing_key,
                error = %err,
                body = %message.body_lossy(),
                "Error publishing message"
            );
            self.retry(message);
            return Ok(Some(EpochEnd::Failed(SessionError::Publish(err))));
        }

        self.stats.record_sent();
        if self.sampled() {
            debug!(
                epoch,
                message_id = %message.id,
                exchange = %message.exchange,
                key = %message.routing_key,
                attempts = message.attempts,
                body = %message.body_lossy(),
                "Sampled: Message published"
            );
        }
        tracker.record(message)?;
        Ok(None)
    }

    fn confirm(&mut self, epoch: u64, tracker: &mut DeliveryTracker, confirmation: Confirmation) {
        let Confirmation { tag, ack } = confirmation;
        let Some(message) = tracker.resolve(tag) else {
            self.stats.record_unknown_confirmation();
            error!(epoch, %tag, ack, "Received confirmation for unknown message");
            return;
        };

        self.stats.record_confirmation(ack);
        debug!(
            epoch,
            %tag,
            ack,
            message_id = %message.id,
            exchange = %message.exchange,
            key = %message.routing_key,
            "Confirmation received"
        );
        if !ack {
            self.retry(message);
        }
    }

    fn retry(&self, message: PublishMessage) {
        let outcome = self.retry.retry(message, &self.requeue);
        self.stats.record_retry(outcome);
    }

    fn sampled(&self) -> bool {
        self.log_sample_rate >= 1.0 || rand::thread_rng().r#gen::<f64>() < self.log_sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeliveryTag;
    use crate::impls::{ConfirmMode, InMemoryBroker};
    use crate::queue::publish_queue;
    use crate::test_support::{PanickingTransport, WAIT, eventually};
    use tokio::time::timeout;

    struct Harness {
        broker: InMemoryBroker,
        queue: QueueSender,
        lifetime: CancellationToken,
        stats: Arc<DeliveryStats>,
        handle: JoinHandle<Result<(), InvariantViolation>>,
    }

    fn spawn_with(transport: Arc<dyn Transport>, broker: InMemoryBroker, capacity: usize, max_attempts: u32) -> Harness {
        let (tx, rx) = publish_queue(capacity);
        let lifetime = CancellationToken::new();
        let stats = Arc::new(DeliveryStats::default());
        let supervisor = Supervisor {
            transport,
            endpoint: Endpoint::new("memory://", "events", ""),
            queue: rx,
            requeue: tx.clone(),
            retry: RetryPolicy::new(max_attempts),
            reconnect_delay: Duration::from_millis(10),
            confirm_capacity: capacity,
            log_sample_rate: 1.0,
            lifetime: lifetime.clone(),
            stats: Arc::clone(&stats),
        };
        Harness {
            broker,
            queue: tx,
            lifetime,
            stats,
            handle: supervisor.spawn(),
        }
    }

    fn spawn(capacity: usize, max_attempts: u32) -> Harness {
        let broker = InMemoryBroker::new();
        spawn_with(Arc::new(broker.clone()), broker, capacity, max_attempts)
    }

    fn msg(key: &str) -> PublishMessage {
        PublishMessage::new("events", key, format!("\"{key}\"").into_bytes())
    }

    impl Harness {
        fn push(&self, key: &str) {
            self.queue.try_push(msg(key)).unwrap();
        }

        async fn stop(self) {
            self.lifetime.cancel();
            timeout(WAIT, self.handle).await.unwrap().unwrap().unwrap();
        }
    }

    fn keys(deliveries: &[crate::impls::Delivery]) -> Vec<String> {
        deliveries.iter().map(|d| d.routing_key.clone()).collect()
    }

    #[tokio::test]
    async fn acked_messages_leave_the_tracker() {
        let h = spawn(8, 3);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        h.push("a");
        h.push("b");

        timeout(WAIT, h.broker.wait_for_pending(2)).await.unwrap();
        h.broker.confirm_pending(true);
        eventually(|| h.stats.snapshot().acked == 2).await;

        let counts = h.stats.snapshot();
        assert_eq!(counts.sent, 2);
        assert_eq!(counts.requeued, 0);
        assert_eq!(counts.epochs, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn tags_follow_send_order_and_restart_each_epoch() {
        let h = spawn(8, 5);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        for key in ["a", "b", "c"] {
            h.push(key);
        }
        timeout(WAIT, h.broker.wait_for_pending(3)).await.unwrap();
        let first: Vec<u64> = h.broker.deliveries_in_epoch(1).iter().map(|d| d.tag.value()).collect();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(keys(&h.broker.deliveries_in_epoch(1)), vec!["a", "b", "c"]);

        h.broker.kill_session("connection reset");
        timeout(WAIT, h.broker.wait_for_epoch(2)).await.unwrap();
        timeout(WAIT, h.broker.wait_for_deliveries(6)).await.unwrap();

        let second = h.broker.deliveries_in_epoch(2);
        let tags: Vec<u64> = second.iter().map(|d| d.tag.value()).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert_eq!(keys(&second), vec!["a", "b", "c"]);
        assert!(second.iter().all(|d| d.message.attempts == 1));
        h.stop().await;
    }

    #[tokio::test]
    async fn unknown_confirmation_is_ignored() {
        let h = spawn(8, 3);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        h.push("a");
        timeout(WAIT, h.broker.wait_for_pending(1)).await.unwrap();

        h.broker.confirm(DeliveryTag::new(99), true);
        eventually(|| h.stats.snapshot().unknown_confirmations == 1).await;

        // The real message is still tracked and can be acked afterwards.
        h.broker.confirm(DeliveryTag::new(1), true);
        eventually(|| h.stats.snapshot().acked == 1).await;
        assert_eq!(h.broker.epochs(), 1);
        assert!(!h.handle.is_finished());
        h.stop().await;
    }

    #[tokio::test]
    async fn nack_requeues_until_ceiling() {
        let h = spawn(8, 3);
        h.broker.set_confirm_mode(ConfirmMode::AutoNack);
        h.push("a");

        eventually(|| h.stats.snapshot().dropped_at_ceiling == 1).await;
        let counts = h.stats.snapshot();
        assert_eq!(counts.sent, 3);
        assert_eq!(counts.nacked, 3);
        assert_eq!(counts.requeued, 2);

        let attempts: Vec<u32> = h.broker.deliveries().iter().map(|d| d.message.attempts).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        // Nacks do not end the session.
        assert_eq!(h.broker.epochs(), 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn session_loss_resubmits_every_outstanding_message() {
        let h = spawn(8, 2);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        for key in ["a", "b", "c", "d"] {
            h.push(key);
        }
        timeout(WAIT, h.broker.wait_for_pending(4)).await.unwrap();
        h.broker.confirm(DeliveryTag::new(2), true);
        eventually(|| h.stats.snapshot().acked == 1).await;

        h.broker.kill_session("heartbeat timeout");
        eventually(|| h.stats.snapshot().requeued == 3).await;
        timeout(WAIT, h.broker.wait_for_deliveries(7)).await.unwrap();
        assert_eq!(keys(&h.broker.deliveries_in_epoch(2)), vec!["a", "c", "d"]);

        // Second loss: everything is at the ceiling of 2 and gets dropped.
        h.broker.kill_session("heartbeat timeout");
        eventually(|| h.stats.snapshot().dropped_at_ceiling == 3).await;
        assert_eq!(h.stats.snapshot().session_failures, 2);
        h.stop().await;
    }

    #[tokio::test]
    async fn closed_confirmation_stream_ends_epoch() {
        let h = spawn(8, 3);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        h.push("a");
        timeout(WAIT, h.broker.wait_for_pending(1)).await.unwrap();

        h.broker.close_confirms();
        timeout(WAIT, h.broker.wait_for_epoch(2)).await.unwrap();
        timeout(WAIT, h.broker.wait_for_deliveries(2)).await.unwrap();
        assert_eq!(h.broker.deliveries()[1].message.attempts, 1);
        h.stop().await;
    }

    #[tokio::test]
    async fn publish_failure_counts_an_attempt_and_reconnects() {
        let h = spawn(8, 3);
        h.broker.fail_next_publishes(1);
        h.push("a");

        timeout(WAIT, h.broker.wait_for_epoch(2)).await.unwrap();
        timeout(WAIT, h.broker.wait_for_deliveries(1)).await.unwrap();
        let delivered = &h.broker.deliveries()[0];
        assert_eq!(delivered.epoch, 2);
        assert_eq!(delivered.message.attempts, 1);
        eventually(|| h.stats.snapshot().acked == 1).await;
        h.stop().await;
    }

    #[tokio::test]
    async fn failed_connects_are_retried_after_delay() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(2);
        let h = spawn_with(Arc::new(broker.clone()), broker, 8, 3);
        h.push("a");

        timeout(WAIT, h.broker.wait_for_deliveries(1)).await.unwrap();
        assert_eq!(h.broker.connect_attempts(), 3);
        assert_eq!(h.stats.snapshot().session_failures, 2);
        // Nothing was sent during the failed attempts.
        assert_eq!(h.broker.deliveries()[0].message.attempts, 0);
        h.stop().await;
    }

    #[tokio::test]
    async fn full_queue_drops_retry_instead_of_blocking() {
        let h = spawn(2, 5);
        h.broker.set_confirm_mode(ConfirmMode::Manual);
        h.push("a");
        h.push("b");
        timeout(WAIT, h.broker.wait_for_pending(2)).await.unwrap();

        // Refill the queue while the broker is down so retries find it full.
        h.broker.set_reachable(false);
        h.broker.kill_session("broker restart");
        h.push("c");
        h.push("d");

        eventually(|| h.stats.snapshot().dropped_queue_full == 2).await;
        h.broker.set_reachable(true);
        timeout(WAIT, h.broker.wait_for_deliveries(4)).await.unwrap();
        // c may have raced the close notification, so only membership is fixed.
        let mut second = keys(&h.broker.deliveries_in_epoch(2));
        second.sort();
        assert_eq!(second, vec!["c", "d"]);
        h.stop().await;
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker_without_reconnecting() {
        let h = spawn(8, 3);
        timeout(WAIT, h.broker.wait_for_epoch(1)).await.unwrap();
        let broker = h.broker.clone();
        h.stop().await;
        timeout(WAIT, broker.wait_for_release()).await.unwrap();
        assert_eq!(broker.epochs(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_wait() {
        let broker = InMemoryBroker::unreachable();
        let (tx, rx) = publish_queue(4);
        let lifetime = CancellationToken::new();
        let supervisor = Supervisor {
            transport: Arc::new(broker.clone()),
            endpoint: Endpoint::new("memory://", "events", ""),
            queue: rx,
            requeue: tx,
            retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(3600),
            confirm_capacity: 4,
            log_sample_rate: 0.0,
            lifetime: lifetime.clone(),
            stats: Arc::new(DeliveryStats::default()),
        };
        let handle = supervisor.spawn();
        timeout(WAIT, broker.wait_for_connect_attempts(1)).await.unwrap();

        lifetime.cancel();
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn worker_panic_is_surfaced_and_cancels_lifetime() {
        let h = spawn_with(Arc::new(PanickingTransport::new()), InMemoryBroker::new(), 4, 3);
        h.push("a");

        let joined = timeout(WAIT, h.handle).await.unwrap();
        assert!(joined.unwrap_err().is_panic());
        assert!(h.lifetime.is_cancelled());
        assert_eq!(h.stats.snapshot().epochs, 1);
        assert_eq!(h.stats.snapshot().session_failures, 0);
    }
}
