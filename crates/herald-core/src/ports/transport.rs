//! Transport port: the broker session seen by the supervisor.
//!
//! An adapter has to:
//! - open a session and declare the topology named by the `Endpoint`
//! - enable asynchronous publisher confirmations
//! - deliver confirmations (in tag order) through `SessionSinks::confirms`
//!   and drop that sender when the session ends
//! - report session death at most once through `SessionSinks::closed`
//!   (dropping it without a value means a graceful close)
//! - tear the session down when the `scope` token is cancelled

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::{Confirmation, PublishMessage, TransportError};

/// Exchange type used for every declared exchange.
pub const EXCHANGE_KIND: &str = "topic";

/// Where to connect and what to declare. Empty names are not declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uri: String,
    pub exchange: String,
    pub queue: String,
}

/// A declaration the adapter performs during session setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange {
        name: String,
        kind: &'static str,
        durable: bool,
        auto_delete: bool,
    },
    Queue {
        name: String,
        durable: bool,
        auto_delete: bool,
    },
}

impl Endpoint {
    pub fn new(uri: impl Into<String>, exchange: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            exchange: exchange.into(),
            queue: queue.into(),
        }
    }

    /// Declarations in the order they are applied: exchange, then queue.
    /// Both durable and never auto-deleted.
    pub fn declarations(&self) -> Vec<Declaration> {
        let mut out = Vec::with_capacity(2);
        if !self.exchange.is_empty() {
            out.push(Declaration::Exchange {
                name: self.exchange.clone(),
                kind: EXCHANGE_KIND,
                durable: true,
                auto_delete: false,
            });
        }
        if !self.queue.is_empty() {
            out.push(Declaration::Queue {
                name: self.queue.clone(),
                durable: true,
                auto_delete: false,
            });
        }
        out
    }
}

/// Adapter-side ends of the per-session event streams.
#[derive(Debug)]
pub struct SessionSinks {
    pub confirms: mpsc::Sender<Confirmation>,
    pub closed: oneshot::Sender<TransportError>,
}

/// Supervisor-side ends of the per-session event streams.
#[derive(Debug)]
pub struct SessionEvents {
    pub confirms: mpsc::Receiver<Confirmation>,
    pub closed: oneshot::Receiver<TransportError>,
}

/// Fresh event streams for one epoch. `capacity` bounds buffered confirmations.
pub fn session_channels(capacity: usize) -> (SessionSinks, SessionEvents) {
    let (confirms_tx, confirms_rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = oneshot::channel();
    (
        SessionSinks {
            confirms: confirms_tx,
            closed: closed_tx,
        },
        SessionEvents {
            confirms: confirms_rx,
            closed: closed_rx,
        },
    )
}

/// An open broker session.
#[async_trait]
pub trait Session: Send {
    /// Send one message. An error means the session is no longer usable.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &PublishMessage,
    ) -> Result<(), TransportError>;
}

/// Opens broker sessions.
///
/// `sinks` is `None` for the construction-time connectivity probe.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(
        &self,
        scope: CancellationToken,
        endpoint: &Endpoint,
        sinks: Option<SessionSinks>,
    ) -> Result<Box<dyn Session>, TransportError>;
}
