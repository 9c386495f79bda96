//! InMemoryBroker - a scriptable `Transport` for tests and the demo binary.
//!
//! Implementation notes:
//! - All state sits behind one `std::sync::Mutex`; no lock is held across an await.
//! - Only one confirm-enabled session is live at a time. A new one replaces it,
//!   which drops the old sinks (the old worker sees its streams close).
//! - A `Notify` is pinged on every state change so tests can wait on conditions
//!   instead of sleeping.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Confirmation, DeliveryTag, PublishMessage, TransportError};
use crate::ports::{Declaration, Endpoint, Session, SessionSinks, Transport};

/// How the broker answers each received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    #[default]
    AutoAck,
    AutoNack,
    /// Nothing is confirmed until `confirm`/`confirm_pending` is called.
    Manual,
}

/// A message as received by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker session (1-based) the message arrived on.
    pub epoch: u64,
    pub tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub message: PublishMessage,
}

struct LiveSession {
    epoch: u64,
    next_tag: DeliveryTag,
    pending: Vec<DeliveryTag>,
    confirms: Option<mpsc::Sender<Confirmation>>,
    closed: Option<oneshot::Sender<TransportError>>,
}

impl LiveSession {
    fn send_confirmation(&self, confirmation: Confirmation) -> bool {
        let Some(confirms) = &self.confirms else {
            return false;
        };
        match confirms.try_send(confirmation) {
            Ok(()) => true,
            Err(err) => {
                warn!(epoch = self.epoch, tag = %confirmation.tag, error = %err, "In-memory broker lost a confirmation");
                false
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_connects: usize,
    failing_publishes: usize,
    confirm_mode: ConfirmMode,
    connect_attempts: u64,
    probes: u64,
    epochs: u64,
    live: Option<LiveSession>,
    deliveries: Vec<Delivery>,
    declarations: Vec<Declaration>,
}

/// In-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that refuses every connection.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_reachable(false);
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) {
        self.notify.notify_waiters();
    }

    // ---- scripting ----

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
        self.changed();
    }

    /// The next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// The next `n` publish calls fail synchronously.
    pub fn fail_next_publishes(&self, n: usize) {
        self.lock().failing_publishes = n;
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.lock().confirm_mode = mode;
    }

    /// Kill the live session with a close notification.
    /// Returns `false` when no session is live.
    pub fn kill_session(&self, reason: &str) -> bool {
        let live = self.lock().live.take();
        let killed = match live {
            Some(mut live) => {
                if let Some(closed) = live.closed.take() {
                    let _ = closed.send(TransportError::Closed(reason.to_string()));
                }
                true
            }
            None => false,
        };
        self.changed();
        killed
    }

    /// Close the confirmation stream of the live session, leaving it open otherwise.
    pub fn close_confirms(&self) -> bool {
        let closed = match self.lock().live.as_mut() {
            Some(live) => live.confirms.take().is_some(),
            None => false,
        };
        self.changed();
        closed
    }

    /// Send a confirmation for `tag` on the live session. Any tag is accepted,
    /// including ones the broker never handed out.
    pub fn confirm(&self, tag: DeliveryTag, ack: bool) -> bool {
        let mut state = self.lock();
        let Some(live) = state.live.as_mut() else {
            return false;
        };
        live.pending.retain(|t| *t != tag);
        let confirmation = if ack { Confirmation::ack(tag) } else { Confirmation::nack(tag) };
        live.send_confirmation(confirmation)
    }

    /// Confirm every pending delivery of the live session, in tag order.
    /// Returns how many confirmations were sent.
    pub fn confirm_pending(&self, ack: bool) -> usize {
        let mut state = self.lock();
        let Some(live) = state.live.as_mut() else {
            return 0;
        };
        let pending = std::mem::take(&mut live.pending);
        pending
            .into_iter()
            .filter(|tag| {
                let confirmation = if ack { Confirmation::ack(*tag) } else { Confirmation::nack(*tag) };
                live.send_confirmation(confirmation)
            })
            .count()
    }

    // ---- inspection ----

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.lock().deliveries.clone()
    }

    pub fn deliveries_in_epoch(&self, epoch: u64) -> Vec<Delivery> {
        self.lock()
            .deliveries
            .iter()
            .filter(|d| d.epoch == epoch)
            .cloned()
            .collect()
    }

    /// Every `connect` call, probes and failures included.
    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Successful probe connections (no sinks).
    pub fn probes(&self) -> u64 {
        self.lock().probes
    }

    /// Confirm-enabled sessions opened so far.
    pub fn epochs(&self) -> u64 {
        self.lock().epochs
    }

    pub fn current_epoch(&self) -> Option<u64> {
        self.lock().live.as_ref().map(|l| l.epoch)
    }

    pub fn pending(&self) -> Vec<DeliveryTag> {
        self.lock()
            .live
            .as_ref()
            .map(|l| l.pending.clone())
            .unwrap_or_default()
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.lock().declarations.clone()
    }

    // ---- waiting ----

    async fn wait_until(&self, condition: impl Fn(&BrokerState) -> bool) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if condition(&*self.lock()) {
                return;
            }
            notified.await;
        }
    }

    pub async fn wait_for_deliveries(&self, count: usize) {
        self.wait_until(|s| s.deliveries.len() >= count).await;
    }

    /// Wait until session `epoch` (or a later one) is live.
    pub async fn wait_for_epoch(&self, epoch: u64) {
        self.wait_until(|s| s.live.as_ref().is_some_and(|l| l.epoch >= epoch)).await;
    }

    pub async fn wait_for_pending(&self, count: usize) {
        self.wait_until(|s| s.live.as_ref().is_some_and(|l| l.pending.len() >= count))
            .await;
    }

    /// Wait until no session is live.
    pub async fn wait_for_release(&self) {
        self.wait_until(|s| s.live.is_none()).await;
    }

    pub async fn wait_for_connect_attempts(&self, count: u64) {
        self.wait_until(|s| s.connect_attempts >= count).await;
    }

    // ---- session lifecycle ----

    fn end_session(&self, epoch: u64) {
        let mut state = self.lock();
        if state.live.as_ref().is_some_and(|l| l.epoch == epoch) {
            state.live = None;
            debug!(epoch, "In-memory broker session released");
        }
        drop(state);
        self.changed();
    }

    fn receive(
        &self,
        epoch: u64,
        exchange: &str,
        routing_key: &str,
        message: &PublishMessage,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(TransportError::Publish("injected publish failure".to_string()));
        }
        let mode = state.confirm_mode;
        let Some(live) = state.live.as_mut().filter(|l| l.epoch == epoch) else {
            return Err(TransportError::Closed("session is no longer open".to_string()));
        };

        let tag = live.next_tag;
        live.next_tag = tag.next();
        match mode {
            ConfirmMode::AutoAck => {
                live.send_confirmation(Confirmation::ack(tag));
            }
            ConfirmMode::AutoNack => {
                live.send_confirmation(Confirmation::nack(tag));
            }
            ConfirmMode::Manual => live.pending.push(tag),
        }

        state.deliveries.push(Delivery {
            epoch,
            tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        drop(state);
        self.changed();
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(
        &self,
        scope: CancellationToken,
        endpoint: &Endpoint,
        sinks: Option<SessionSinks>,
    ) -> Result<Box<dyn Session>, TransportError> {
        let epoch = {
            let mut state = self.lock();
            state.connect_attempts += 1;

            if state.unreachable {
                drop(state);
                self.changed();
                return Err(TransportError::Unreachable(endpoint.uri.clone()));
            }
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                drop(state);
                self.changed();
                return Err(TransportError::Unreachable(format!("{} (injected)", endpoint.uri)));
            }

            for declaration in endpoint.declarations() {
                if !state.declarations.contains(&declaration) {
                    state.declarations.push(declaration);
                }
            }

            match sinks {
                None => {
                    state.probes += 1;
                    0
                }
                Some(sinks) => {
                    state.epochs += 1;
                    let epoch = state.epochs;
                    state.live = Some(LiveSession {
                        epoch,
                        next_tag: DeliveryTag::FIRST,
                        pending: Vec::new(),
                        confirms: Some(sinks.confirms),
                        closed: Some(sinks.closed),
                    });
                    epoch
                }
            }
        };
        self.changed();

        if epoch > 0 {
            let broker = self.clone();
            tokio::spawn(async move {
                scope.cancelled().await;
                broker.end_session(epoch);
            });
        }

        Ok(Box::new(MemorySession {
            epoch,
            broker: self.clone(),
        }))
    }
}

struct MemorySession {
    epoch: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &PublishMessage,
    ) -> Result<(), TransportError> {
        self.broker.receive(self.epoch, exchange, routing_key, message)
    }
}
