//! herald-core
//!
//! Asynchronous, at-least-once message producer for topic exchanges.
//!
//! # Modules
//! - **domain**: messages, delivery tags, error types
//! - **ports**: `Transport`/`Session` seam to the broker
//! - **queue**: bounded publish queue, delivery tracker, retry policy
//! - **app**: `Producer` and its background supervisor
//! - **impls**: `InMemoryBroker`

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

#[cfg(test)]
mod test_support;

pub use app::{DeliveryCounts, Producer, ProducerConfig};
pub use domain::{ProducerError, PublishError, TransportError};
pub use impls::InMemoryBroker;
pub use ports::{Endpoint, Transport};
