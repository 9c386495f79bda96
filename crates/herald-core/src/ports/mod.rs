//! Ports - the seams to external systems.
//!
//! The broker is reached only through `Transport`/`Session`, so the
//! supervisor runs unchanged against the in-memory broker in `impls`.

pub mod transport;

pub use self::transport::{
    Declaration, EXCHANGE_KIND, Endpoint, Session, SessionEvents, SessionSinks, Transport,
    session_channels,
};
