//! Fakes and helpers shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::domain::{PublishMessage, TransportError};
use crate::ports::{Endpoint, Session, SessionSinks, Transport};

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds, failing the test after `WAIT`.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Connects fine; the first publish panics, once `gate` lets it through.
///
/// Sessions hold their sinks, so the worker never sees the session close
/// and always reaches the publish.
pub struct PanickingTransport {
    gate: Option<Arc<Notify>>,
}

impl PanickingTransport {
    pub fn new() -> Self {
        Self { gate: None }
    }

    /// Publishes wait for `gate.notify_one()` before panicking.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate) }
    }
}

struct PanickingSession {
    gate: Option<Arc<Notify>>,
    _sinks: Option<SessionSinks>,
}

#[async_trait]
impl Session for PanickingSession {
    async fn publish(
        &mut self,
        _exchange: &str,
        _routing_key: &str,
        _message: &PublishMessage,
    ) -> Result<(), TransportError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        panic!("corrupted session state");
    }
}

#[async_trait]
impl Transport for PanickingTransport {
    async fn connect(
        &self,
        _scope: CancellationToken,
        _endpoint: &Endpoint,
        sinks: Option<SessionSinks>,
    ) -> Result<Box<dyn Session>, TransportError> {
        Ok(Box::new(PanickingSession {
            gate: self.gate.clone(),
            _sinks: sinks,
        }))
    }
}

/// Probes succeed; worker connects hang until their scope is cancelled.
pub struct StalledTransport;

struct NoopSession;

#[async_trait]
impl Session for NoopSession {
    async fn publish(
        &mut self,
        _exchange: &str,
        _routing_key: &str,
        _message: &PublishMessage,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl Transport for StalledTransport {
    async fn connect(
        &self,
        scope: CancellationToken,
        _endpoint: &Endpoint,
        sinks: Option<SessionSinks>,
    ) -> Result<Box<dyn Session>, TransportError> {
        if sinks.is_some() {
            scope.cancelled().await;
            return Err(TransportError::Cancelled);
        }
        Ok(Box::new(NoopSession))
    }
}
