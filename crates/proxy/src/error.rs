//! Error types and the failure taxonomy.

use thiserror::Error;

/// Failure reported by the broker layer.
#[derive(Debug, Error)]
pub enum BrokerError {
	/// The broker connection was lost; no further traffic is possible.
	#[error("broker connection lost: {0}")]
	ConnectionLost(String),
	/// A send to a named destination failed.
	#[error("send to {destination} failed: {reason}")]
	SendFailed {
		/// Destination the send targeted.
		destination: String,
		/// Broker-reported reason.
		reason: String,
	},
	/// The consumer registration was rejected or has been detached.
	#[error("consumer unavailable: {0}")]
	ConsumerUnavailable(String),
}

/// Failure converting between payload bytes and a domain message.
#[derive(Debug, Error)]
pub enum SerializeError {
	/// Encoding a domain message failed.
	#[error("encode failed: {0}")]
	Encode(String),
	/// Decoding payload bytes failed.
	#[error("decode failed: {0}")]
	Decode(String),
}

/// Failure reported by the downstream handler.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
	message: String,
}

impl HandlerError {
	/// Create a handler error from a message.
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			message: message.into(),
		}
	}
}

impl From<&str> for HandlerError {
	fn from(message: &str) -> Self {
		Self::new(message)
	}
}

/// Failure writing through a response context.
#[derive(Debug, Error)]
pub enum SendError {
	/// The response could not be encoded.
	#[error(transparent)]
	Serialize(#[from] SerializeError),
	/// The broker rejected the send.
	#[error(transparent)]
	Broker(#[from] BrokerError),
}

/// Invalid proxy configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	/// `max_concurrent_calls` must be at least 1.
	#[error("max_concurrent_calls must be at least 1")]
	ZeroConcurrency,
	/// `max_message_size` must be positive.
	#[error("max_message_size must be positive")]
	ZeroMessageSize,
	/// The serializer collection must not be empty.
	#[error("at least one serializer is required")]
	NoSerializers,
	/// Two serializers share an identifier.
	#[error("duplicate serializer id: {0}")]
	DuplicateSerializer(String),
}

/// Failure taxonomy carried on terminal `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Unknown version or serializer, malformed headers.
	Incompatible,
	/// Deadline exceeded before or during processing.
	Timeout,
	/// The downstream handler failed.
	Handler,
	/// A broker-layer send or receive failed.
	Broker,
}

impl ErrorKind {
	/// The wire tag for this kind.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Incompatible => "incompatible",
			Self::Timeout => "timeout",
			Self::Handler => "handler",
			Self::Broker => "broker",
		}
	}
}
