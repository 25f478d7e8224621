//! Wire protocol for the Parley voice relay: typed length-prefixed framing,
//! voice payload and telemetry report codecs, and the JSON control bodies.
//!
//! This crate is pure data translation — no sockets, no async.

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;
pub mod voice;
