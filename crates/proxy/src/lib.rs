#![warn(missing_docs)]

//! Server-side request proxy for broker-mediated request/response messaging.
//!
//! A request sink submits a logical request over a message broker and expects
//! zero or more responses followed by a terminal end-of-stream marker. This
//! crate implements the server half: it subscribes to a destination, admits at
//! most `max_concurrent_calls` requests at a time, coordinates multi-fragment
//! uploads over private reply channels, invokes a downstream [`Handler`], and
//! streams its responses back through the broker.

pub mod adapter;
pub mod config;
pub mod core;
pub mod error;
pub mod metrics;
pub mod serializer;

pub use config::ProxyConfig;
pub use crate::core::{Handler, ListenerId, RequestProxy, ResponseContext};
pub use error::{
	BrokerError, ConfigError, ErrorKind, HandlerError, SendError, SerializeError,
};
pub use metrics::MetricsSnapshot;
pub use relay_proto as proto;
pub use serializer::{JsonSerializer, PostcardSerializer, Serializer, SerializerRegistry};
