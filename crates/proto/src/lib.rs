//! Shared wire vocabulary for the relay request proxy.
//!
//! This crate defines the header names, identifier newtypes, message-type tags,
//! and the typed envelope exchanged between request sinks and the proxy over a
//! message broker. Payloads are opaque bytes; serialization of domain values is
//! the proxy's concern, not the wire's.

#![warn(missing_docs)]

pub mod headers;
pub mod types;

pub use types::*;
