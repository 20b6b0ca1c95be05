//! Header names and the envelope ⇄ header-map codec.
//!
//! The broker adapter contract moves byte payloads plus a flat map of
//! string-to-scalar headers. This module names the header vocabulary and
//! converts between that raw map and the typed [`Envelope`].

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::{CallId, Deadline, Destination, Envelope, MessageType, ProtocolVersion};

/// Message classification tag.
pub const MSG_TYPE: &str = "x-msg-type";
/// Protocol version integer.
pub const PROTO_VER: &str = "x-proto-ver";
/// Serializer identifier, ASCII, at most 32 bytes.
pub const SERIALIZER_ID: &str = "x-serializer-id";
/// Absolute deadline, milliseconds since the Unix epoch.
pub const REQ_TIMEOUT: &str = "x-req-timeout";
/// Zero-based fragment index for multi-part payloads.
pub const FRAG_IDX: &str = "x-frag-idx";
/// Total fragment count for multi-part payloads.
pub const FRAG_TOTAL: &str = "x-frag-total";
/// Maximum fragment size advertised on upload negotiation.
pub const FRAG_MAX: &str = "x-frag-max";
/// Error taxonomy tag on terminal error messages.
pub const ERROR_KIND: &str = "x-error-kind";
/// Broker-native correlation identifier field.
pub const CORRELATION_ID: &str = "correlation-id";
/// Broker-native reply destination field.
pub const REPLY_TO: &str = "reply-to";

/// Maximum byte length of a serializer identifier.
pub const MAX_SERIALIZER_ID_LEN: usize = 32;

/// A scalar header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
	/// A UTF-8 string value.
	Str(String),
	/// A signed integer value.
	Int(i64),
}

impl HeaderValue {
	/// The string form of this value, if it is one.
	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Str(s) => Some(s),
			Self::Int(_) => None,
		}
	}

	/// The integer form of this value, if it is one.
	#[must_use]
	pub fn as_int(&self) -> Option<i64> {
		match self {
			Self::Str(_) => None,
			Self::Int(i) => Some(*i),
		}
	}
}

/// Flat header map as carried by the broker adapter.
pub type Headers = HashMap<String, HeaderValue>;

/// Returns true if `id` is a well-formed serializer identifier.
#[must_use]
pub fn valid_serializer_id(id: &str) -> bool {
	!id.is_empty() && id.len() <= MAX_SERIALIZER_ID_LEN && id.is_ascii()
}

fn str_header(headers: &Headers, name: &str) -> Option<String> {
	headers.get(name).and_then(|v| v.as_str()).map(str::to_string)
}

fn int_header(headers: &Headers, name: &str) -> Option<i64> {
	headers.get(name).and_then(HeaderValue::as_int)
}

impl Envelope {
	/// Render this envelope as a raw header map.
	///
	/// Only fields that are set produce entries.
	#[must_use]
	pub fn to_headers(&self) -> Headers {
		let mut headers = Headers::new();
		if let Some(call_id) = &self.call_id {
			headers.insert(CORRELATION_ID.into(), HeaderValue::Str(call_id.0.clone()));
		}
		if let Some(reply_to) = &self.reply_to {
			headers.insert(REPLY_TO.into(), HeaderValue::Str(reply_to.0.clone()));
		}
		if let Some(message_type) = self.message_type {
			headers.insert(MSG_TYPE.into(), HeaderValue::Str(message_type.as_str().into()));
		}
		if let Some(serializer_id) = &self.serializer_id {
			headers.insert(SERIALIZER_ID.into(), HeaderValue::Str(serializer_id.clone()));
		}
		if let Some(version) = self.version {
			headers.insert(PROTO_VER.into(), HeaderValue::Int(i64::from(version.0)));
		}
		if let Some(deadline) = self.deadline {
			headers.insert(REQ_TIMEOUT.into(), HeaderValue::Int(deadline.0 as i64));
		}
		if let Some(idx) = self.fragment_index {
			headers.insert(FRAG_IDX.into(), HeaderValue::Int(i64::from(idx)));
		}
		if let Some(total) = self.fragment_total {
			headers.insert(FRAG_TOTAL.into(), HeaderValue::Int(i64::from(total)));
		}
		if let Some(max) = self.fragment_max {
			headers.insert(FRAG_MAX.into(), HeaderValue::Int(i64::from(max)));
		}
		if let Some(kind) = &self.error_kind {
			headers.insert(ERROR_KIND.into(), HeaderValue::Str(kind.clone()));
		}
		headers
	}

	/// Decode a raw header map and payload into a typed envelope.
	///
	/// Fields that are absent, of the wrong scalar kind, or out of range decode
	/// to `None`; classification of such messages is the dispatcher's call.
	#[must_use]
	pub fn from_headers(headers: &Headers, payload: Bytes) -> Self {
		let serializer_id = str_header(headers, SERIALIZER_ID).filter(|id| valid_serializer_id(id));
		let version = int_header(headers, PROTO_VER)
			.and_then(|v| u16::try_from(v).ok())
			.map(ProtocolVersion);
		let deadline = int_header(headers, REQ_TIMEOUT)
			.and_then(|v| u64::try_from(v).ok())
			.map(Deadline);

		Self {
			call_id: str_header(headers, CORRELATION_ID).map(CallId),
			reply_to: str_header(headers, REPLY_TO).map(Destination),
			message_type: str_header(headers, MSG_TYPE).as_deref().and_then(MessageType::parse),
			serializer_id,
			version,
			deadline,
			fragment_index: int_header(headers, FRAG_IDX).and_then(|v| u32::try_from(v).ok()),
			fragment_total: int_header(headers, FRAG_TOTAL).and_then(|v| u32::try_from(v).ok()),
			fragment_max: int_header(headers, FRAG_MAX).and_then(|v| u32::try_from(v).ok()),
			error_kind: str_header(headers, ERROR_KIND),
			payload,
		}
	}
}
