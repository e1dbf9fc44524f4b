//! Stream event protocol for Weft runs: type + payload + envelope.
//!
//! This crate defines the wire shape of a single stream event and envelope injection.
//! It does not depend on weft. Weft emits `ProtocolEvent`s from the reasoning loop and
//! the CLI (or any other sink) calls `to_json` to render each one.

pub mod envelope;
pub mod event;

pub use envelope::{to_json, Envelope, EnvelopeState};
pub use event::ProtocolEvent;
