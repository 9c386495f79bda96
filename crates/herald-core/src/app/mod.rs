//! App - the producer and its background worker.
//!
//! # Components
//! - **Producer**: public handle; encodes and enqueues
//! - **Supervisor**: per-connection publish loop with reconnect
//! - **ProducerConfig**: settings and defaults
//! - **DeliveryStats**: counters shared by both sides

pub mod config;
pub mod producer;
pub mod status;
mod supervisor;

pub use self::config::{DEFAULT_RECONNECT_DELAY, ProducerConfig};
pub use self::producer::Producer;
pub use self::status::{DeliveryCounts, DeliveryStats};
