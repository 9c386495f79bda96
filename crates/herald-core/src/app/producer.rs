//! Producer - the public publishing handle.
//!
//! `publish` only encodes and enqueues; broker I/O happens on the
//! background worker (see `supervisor`). A returned `Ok` means "accepted for
//! best-effort delivery", not "delivered".

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::config::ProducerConfig;
use super::status::{DeliveryCounts, DeliveryStats};
use super::supervisor::Supervisor;
use crate::domain::{
    InvariantViolation, ProducerError, PublishError, PublishMessage, TransportError, namespaced_key,
};
use crate::ports::{Endpoint, Transport};
use crate::queue::{PushError, QueueSender, RetryPolicy, publish_queue};

/// Asynchronous, at-least-once publisher to one exchange.
///
/// # Example
/// ```ignore
/// let broker = InMemoryBroker::new();
/// let producer = Producer::connect(Arc::new(broker), ProducerConfig::new("memory://", "events")).await?;
/// producer.publish("device.up", &serde_json::json!({ "id": 7 })).await?;
/// producer.shutdown().await?;
/// ```
pub struct Producer {
    exchange: String,
    key_namespace: Option<String>,
    queue: QueueSender,
    lifetime: CancellationToken,
    stats: Arc<DeliveryStats>,
    worker: Option<JoinHandle<Result<(), InvariantViolation>>>,
}

impl Producer {
    /// Probe the broker, then start the background worker.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ProducerConfig,
    ) -> Result<Self, ProducerError> {
        Self::with_lifetime(transport, config, CancellationToken::new()).await
    }

    /// Like `connect`, but the producer also stops when `parent` is cancelled.
    pub async fn with_lifetime(
        transport: Arc<dyn Transport>,
        config: ProducerConfig,
        parent: CancellationToken,
    ) -> Result<Self, ProducerError> {
        config.validate()?;
        let lifetime = parent.child_token();
        let endpoint = config.endpoint();

        if let Err(err) = probe(transport.as_ref(), &endpoint, &lifetime).await {
            error!(uri = %endpoint.uri, error = %err, "Broker connectivity probe failed");
            return Err(ProducerError::Connect(err));
        }
        info!(uri = %endpoint.uri, exchange = %endpoint.exchange, queue = %endpoint.queue, "Broker connectivity probe succeeded");

        let (queue, receiver) = publish_queue(config.queue_capacity);
        let stats = Arc::new(DeliveryStats::default());
        let supervisor = Supervisor {
            transport,
            endpoint,
            queue: receiver,
            requeue: queue.clone(),
            retry: RetryPolicy::new(config.max_attempts),
            reconnect_delay: config.reconnect_delay,
            confirm_capacity: config.queue_capacity,
            log_sample_rate: config.publish_log_sample_rate,
            lifetime: lifetime.clone(),
            stats: Arc::clone(&stats),
        };

        Ok(Self {
            exchange: config.exchange,
            key_namespace: config.key_namespace,
            queue,
            lifetime,
            stats,
            worker: Some(supervisor.spawn()),
        })
    }

    /// Encode `body` as JSON and enqueue it, waiting for queue space.
    ///
    /// # Errors
    /// - `Encode` if `body` cannot be serialized
    /// - `ProducerClosed` if the producer stops before space frees
    pub async fn publish<B>(&self, key: &str, body: &B) -> Result<(), PublishError>
    where
        B: Serialize + ?Sized,
    {
        self.enqueue(key, body, std::future::pending()).await
    }

    /// `publish`, abandoned with `Canceled` once `cancel` fires.
    pub async fn publish_with_cancel<B>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        body: &B,
    ) -> Result<(), PublishError>
    where
        B: Serialize + ?Sized,
    {
        self.enqueue(key, body, async {
            cancel.cancelled().await;
            PublishError::Canceled
        })
        .await
    }

    /// `publish`, abandoned with `DeadlineExceeded` after `timeout`.
    pub async fn publish_timeout<B>(
        &self,
        timeout: Duration,
        key: &str,
        body: &B,
    ) -> Result<(), PublishError>
    where
        B: Serialize + ?Sized,
    {
        self.enqueue(key, body, async {
            tokio::time::sleep(timeout).await;
            PublishError::DeadlineExceeded
        })
        .await
    }

    async fn enqueue<B, F>(&self, key: &str, body: &B, interrupt: F) -> Result<(), PublishError>
    where
        B: Serialize + ?Sized,
        F: Future<Output = PublishError>,
    {
        let raw = serde_json::to_vec(body)?;
        let message = self.new_message(key, raw);
        debug!(
            message_id = %message.id,
            exchange = %message.exchange,
            key = %message.routing_key,
            body = %message.body_lossy(),
            "Publishing message"
        );

        if self.lifetime.is_cancelled() {
            return Err(PublishError::ProducerClosed);
        }
        let interrupt = async {
            tokio::select! {
                reason = interrupt => reason,
                _ = self.lifetime.cancelled() => PublishError::ProducerClosed,
            }
        };

        match self.queue.push_or(message, interrupt).await {
            Ok(()) => {
                self.stats.record_accepted();
                Ok(())
            }
            Err(PushError::Interrupted(reason)) => Err(reason),
            Err(PushError::Closed) => Err(PublishError::ProducerClosed),
        }
    }

    fn new_message(&self, key: &str, body: Vec<u8>) -> PublishMessage {
        let routing_key = namespaced_key(self.key_namespace.as_deref(), key);
        PublishMessage::new(&self.exchange, routing_key, body)
    }

    pub fn counts(&self) -> DeliveryCounts {
        self.stats.snapshot()
    }

    /// Messages waiting for the worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Token cancelled when this producer stops, for whatever reason.
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Stop the worker and wait for it.
    ///
    /// Messages still queued or unconfirmed are abandoned.
    ///
    /// # Errors
    /// `WorkerFault` if the worker had stopped on an internal fault or panicked.
    pub async fn shutdown(mut self) -> Result<(), ProducerError> {
        self.lifetime.cancel();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(fault)) => Err(ProducerError::WorkerFault(fault.to_string())),
            Err(join) => Err(ProducerError::WorkerFault(join.to_string())),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// One throwaway connection to check the broker is reachable. The probe
/// session is released as soon as the scope is cancelled.
async fn probe(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    lifetime: &CancellationToken,
) -> Result<(), TransportError> {
    let scope = lifetime.child_token();
    let result = transport.connect(scope.clone(), endpoint, None).await;
    scope.cancel();
    result.map(drop)
}
