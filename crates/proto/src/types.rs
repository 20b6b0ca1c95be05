//! Core wire types for the relay request proxy.
//!
//! This module defines the identifiers, tags, and the typed message envelope
//! that travel between request sinks and the proxy. The raw header-map
//! rendering of an [`Envelope`] lives in [`crate::headers`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Client-assigned correlation identifier, unique per in-flight call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
	/// Borrow the identifier as a string slice.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for CallId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for CallId {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Broker-addressable endpoint name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination(pub String);

impl Destination {
	/// Borrow the destination name as a string slice.
	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for Destination {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for Destination {
	fn from(s: &str) -> Self {
		Self(s.to_string())
	}
}

/// Protocol version tag negotiated in headers.
///
/// All contexts associated with one call share a version. Unknown tags are
/// the only cross-version gate; anything within a known tag must be tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
	/// The current protocol version.
	pub const V1: ProtocolVersion = ProtocolVersion(1);

	/// Returns true if this version tag is known to the proxy.
	#[must_use]
	pub fn is_supported(self) -> bool {
		self == Self::V1
	}
}

/// Broker send priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Default for Priority {
	fn default() -> Self {
		Self(4)
	}
}

/// Absolute call deadline, in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Deadline(pub u64);

impl Deadline {
	/// A deadline the given duration from now.
	#[must_use]
	pub fn from_now(timeout: Duration) -> Self {
		Self(now_millis().saturating_add(timeout.as_millis() as u64))
	}

	/// Time left until the deadline, or `None` if it has passed.
	#[must_use]
	pub fn remaining(self) -> Option<Duration> {
		let now = now_millis();
		(self.0 > now).then(|| Duration::from_millis(self.0 - now))
	}

	/// Returns true once the deadline has been reached.
	#[must_use]
	pub fn has_passed(self) -> bool {
		now_millis() >= self.0
	}
}

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::ZERO)
		.as_millis() as u64
}

/// Classification of messages on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
	/// One-shot request carrying the full serialized payload.
	Signal,
	/// Control message announcing a fragmented upload.
	ChannelRequest,
	/// One fragment of an in-progress upload.
	ChannelUpload,
	/// Terminal marker of a fragmented upload.
	ChannelEnd,
	/// One streamed response.
	Response,
	/// One fragment of an oversized response.
	ResponseFragment,
	/// Terminal marker of a fragmented response.
	ResponseFragmentEnd,
	/// Terminal end-of-stream marker for a call.
	EndOfStream,
	/// Terminal error marker for a call.
	Error,
}

impl MessageType {
	/// The wire tag for this message type.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Signal => "signal",
			Self::ChannelRequest => "channel-request",
			Self::ChannelUpload => "channel-upload",
			Self::ChannelEnd => "channel-end",
			Self::Response => "response",
			Self::ResponseFragment => "response-fragment",
			Self::ResponseFragmentEnd => "response-fragment-end",
			Self::EndOfStream => "end-of-stream",
			Self::Error => "error",
		}
	}

	/// Parse a wire tag, returning `None` for unknown tags.
	#[must_use]
	pub fn parse(tag: &str) -> Option<Self> {
		match tag {
			"signal" => Some(Self::Signal),
			"channel-request" => Some(Self::ChannelRequest),
			"channel-upload" => Some(Self::ChannelUpload),
			"channel-end" => Some(Self::ChannelEnd),
			"response" => Some(Self::Response),
			"response-fragment" => Some(Self::ResponseFragment),
			"response-fragment-end" => Some(Self::ResponseFragmentEnd),
			"end-of-stream" => Some(Self::EndOfStream),
			"error" => Some(Self::Error),
			_ => None,
		}
	}
}

/// Typed view of one broker message.
///
/// Every field except the payload is optional: inbound messages may be
/// malformed, and the dispatcher counts those rather than failing decode.
/// Outbound construction starts from [`Envelope::new`] and fills in what the
/// message type requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	/// Correlation identifier for the call.
	pub call_id: Option<CallId>,
	/// Destination the peer expects replies on.
	pub reply_to: Option<Destination>,
	/// Message classification tag.
	pub message_type: Option<MessageType>,
	/// Identifier of the codec used for the payload.
	pub serializer_id: Option<String>,
	/// Protocol version tag.
	pub version: Option<ProtocolVersion>,
	/// Absolute call deadline.
	pub deadline: Option<Deadline>,
	/// Zero-based fragment index for multi-part payloads.
	pub fragment_index: Option<u32>,
	/// Total fragment count for multi-part payloads.
	pub fragment_total: Option<u32>,
	/// Maximum fragment size advertised on upload negotiation.
	pub fragment_max: Option<u32>,
	/// Error taxonomy tag on terminal `error` messages.
	pub error_kind: Option<String>,
	/// Opaque payload bytes.
	pub payload: Bytes,
}

impl Envelope {
	/// Create an empty envelope of the given type.
	#[must_use]
	pub fn new(message_type: MessageType) -> Self {
		Self {
			call_id: None,
			reply_to: None,
			message_type: Some(message_type),
			serializer_id: None,
			version: None,
			deadline: None,
			fragment_index: None,
			fragment_total: None,
			fragment_max: None,
			error_kind: None,
			payload: Bytes::new(),
		}
	}
}
