//! Impls - `Transport` implementations.
//!
//! Only the in-memory broker lives here. A network client implements the
//! same trait in its own crate.

pub mod memory_broker;

pub use self::memory_broker::{ConfirmMode, Delivery, InMemoryBroker};
