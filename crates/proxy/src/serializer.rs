//! Payload codecs and the id-keyed serializer registry.
//!
//! A serializer converts between opaque payload bytes and the downstream
//! handler's domain message type. The identifier carried in `x-serializer-id`
//! selects the codec per message; all contexts of one call use the codec the
//! initiating message named.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{ConfigError, SerializeError};

/// Codec between payload bytes and domain messages of type `M`.
pub trait Serializer<M>: Send + Sync + 'static {
	/// Stable identifier for this codec, at most 32 ASCII bytes.
	fn id(&self) -> &'static str;

	/// Encode a domain message into payload bytes.
	fn serialize(&self, message: &M) -> Result<Bytes, SerializeError>;

	/// Decode payload bytes into a domain message.
	fn deserialize(&self, bytes: &[u8]) -> Result<M, SerializeError>;
}

/// Id-keyed collection of serializers for one message type.
pub struct SerializerRegistry<M> {
	by_id: HashMap<&'static str, Arc<dyn Serializer<M>>>,
}

impl<M> Clone for SerializerRegistry<M> {
	fn clone(&self) -> Self {
		Self {
			by_id: self.by_id.clone(),
		}
	}
}

impl<M> std::fmt::Debug for SerializerRegistry<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SerializerRegistry")
			.field("ids", &self.by_id.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl<M: 'static> SerializerRegistry<M> {
	/// Build a registry from a non-empty collection of serializers.
	pub fn new(serializers: Vec<Arc<dyn Serializer<M>>>) -> Result<Self, ConfigError> {
		if serializers.is_empty() {
			return Err(ConfigError::NoSerializers);
		}

		let mut by_id = HashMap::with_capacity(serializers.len());
		for serializer in serializers {
			let id = serializer.id();
			if by_id.insert(id, serializer).is_some() {
				return Err(ConfigError::DuplicateSerializer(id.to_string()));
			}
		}
		Ok(Self { by_id })
	}

	/// Look up a serializer by its wire identifier.
	#[must_use]
	pub fn get(&self, id: &str) -> Option<Arc<dyn Serializer<M>>> {
		self.by_id.get(id).cloned()
	}
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<M> Serializer<M> for JsonSerializer
where
	M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
	fn id(&self) -> &'static str {
		"json"
	}

	fn serialize(&self, message: &M) -> Result<Bytes, SerializeError> {
		serde_json::to_vec(message)
			.map(Bytes::from)
			.map_err(|e| SerializeError::Encode(e.to_string()))
	}

	fn deserialize(&self, bytes: &[u8]) -> Result<M, SerializeError> {
		serde_json::from_slice(bytes).map_err(|e| SerializeError::Decode(e.to_string()))
	}
}

/// Compact binary codec backed by `postcard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardSerializer;

impl<M> Serializer<M> for PostcardSerializer
where
	M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
	fn id(&self) -> &'static str {
		"postcard"
	}

	fn serialize(&self, message: &M) -> Result<Bytes, SerializeError> {
		postcard::to_allocvec(message)
			.map(Bytes::from)
			.map_err(|e| SerializeError::Encode(e.to_string()))
	}

	fn deserialize(&self, bytes: &[u8]) -> Result<M, SerializeError> {
		postcard::from_bytes(bytes).map_err(|e| SerializeError::Decode(e.to_string()))
	}
}
