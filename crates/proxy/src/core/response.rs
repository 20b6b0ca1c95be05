//! Streaming response context for one call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use relay_proto::{CallId, Deadline, Destination, Envelope, MessageType, Priority, ProtocolVersion};

use crate::adapter::Producer;
use crate::error::{BrokerError, ErrorKind, SendError};
use crate::metrics::ProxyMetrics;
use crate::serializer::Serializer;

/// Reply sink for one call.
///
/// Owned jointly by the call table and the downstream handler. Responses
/// written here are serialized and sent to the call's reply destination in
/// write order; a response larger than the configured message size is split
/// into `response-fragment` messages terminated by `response-fragment-end`.
///
/// Once closed — by end-of-stream, a terminal error, the deadline, or proxy
/// teardown — further writes are dropped silently, since a slow handler may
/// legitimately write after its call has been torn down.
pub struct ResponseContext<M> {
	call_id: CallId,
	reply_to: Destination,
	deadline: Deadline,
	version: ProtocolVersion,
	serializer: Arc<dyn Serializer<M>>,
	max_message_size: usize,
	priority: Priority,
	producer: Arc<dyn Producer>,
	metrics: Arc<ProxyMetrics>,
	closed: AtomicBool,
	/// Serializes writes so responses leave in `send_response` order.
	send_lock: Mutex<()>,
}

impl<M: 'static> ResponseContext<M> {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		call_id: CallId,
		reply_to: Destination,
		deadline: Deadline,
		version: ProtocolVersion,
		serializer: Arc<dyn Serializer<M>>,
		max_message_size: usize,
		priority: Priority,
		producer: Arc<dyn Producer>,
		metrics: Arc<ProxyMetrics>,
	) -> Arc<Self> {
		Arc::new(Self {
			call_id,
			reply_to,
			deadline,
			version,
			serializer,
			max_message_size,
			priority,
			producer,
			metrics,
			closed: AtomicBool::new(false),
			send_lock: Mutex::new(()),
		})
	}

	/// The correlation identifier of this call.
	#[must_use]
	pub fn call_id(&self) -> &CallId {
		&self.call_id
	}

	/// True once a terminal message was written, the deadline passed, or the
	/// call was torn down.
	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire) || self.deadline.has_passed()
	}

	/// Serialize and send one response message.
	///
	/// Writes after close are dropped. A write after the deadline closes the
	/// context without emitting anything; the client is already gone.
	pub fn send_response(&self, message: &M) -> Result<(), SendError> {
		let _guard = self.send_lock.lock().unwrap();
		if self.closed.load(Ordering::Acquire) {
			return Ok(());
		}
		if self.deadline.has_passed() {
			self.closed.store(true, Ordering::Release);
			tracing::debug!(call_id = %self.call_id, "response write after deadline; closing call");
			return Ok(());
		}

		let bytes = match self.serializer.serialize(message) {
			Ok(bytes) => bytes,
			Err(e) => {
				tracing::warn!(call_id = %self.call_id, error = %e, "response encode failed");
				self.metrics.error();
				self.closed.store(true, Ordering::Release);
				let _ = self.send_terminal(
					MessageType::Error,
					Some(ErrorKind::Handler),
					Bytes::copy_from_slice(e.to_string().as_bytes()),
				);
				return Err(e.into());
			}
		};

		let result = if bytes.len() > self.max_message_size {
			self.send_fragmented(&bytes)
		} else {
			let mut envelope = self.base_envelope(MessageType::Response);
			envelope.payload = bytes;
			self.producer.send(&self.reply_to, envelope, self.priority)
		};

		if let Err(e) = result {
			// Recoverable broker failure: this call closes, the proxy goes on.
			tracing::warn!(call_id = %self.call_id, error = %e, "response send failed; closing call");
			self.metrics.error();
			self.closed.store(true, Ordering::Release);
			return Err(e.into());
		}
		Ok(())
	}

	/// Send the terminal end-of-stream marker and close.
	pub fn end_of_stream(&self) {
		let _guard = self.send_lock.lock().unwrap();
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		if self.deadline.has_passed() {
			return;
		}
		let _ = self.send_terminal(MessageType::EndOfStream, None, Bytes::new());
	}

	/// Send a terminal error message and close.
	///
	/// The *error* counter is incremented exactly once per context; calling
	/// this on an already-closed context is a no-op.
	pub fn report_error(&self, kind: ErrorKind, detail: &str) {
		let _guard = self.send_lock.lock().unwrap();
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.metrics.error();
		if self.deadline.has_passed() {
			return;
		}
		let _ = self.send_terminal(
			MessageType::Error,
			Some(kind),
			Bytes::copy_from_slice(detail.as_bytes()),
		);
	}

	/// Close without emitting anything. Proxy teardown only.
	pub(crate) fn force_close(&self) {
		self.closed.store(true, Ordering::Release);
	}

	fn base_envelope(&self, message_type: MessageType) -> Envelope {
		let mut envelope = Envelope::new(message_type);
		envelope.call_id = Some(self.call_id.clone());
		envelope.version = Some(self.version);
		envelope.serializer_id = Some(self.serializer.id().to_string());
		envelope
	}

	fn send_fragmented(&self, bytes: &Bytes) -> Result<(), BrokerError> {
		let total = bytes.len().div_ceil(self.max_message_size) as u32;
		for (index, offset) in (0..bytes.len()).step_by(self.max_message_size).enumerate() {
			let end = (offset + self.max_message_size).min(bytes.len());
			let mut envelope = self.base_envelope(MessageType::ResponseFragment);
			envelope.fragment_index = Some(index as u32);
			envelope.fragment_total = Some(total);
			envelope.payload = bytes.slice(offset..end);
			self.producer.send(&self.reply_to, envelope, self.priority)?;
		}

		let mut end_marker = self.base_envelope(MessageType::ResponseFragmentEnd);
		end_marker.fragment_total = Some(total);
		self.producer.send(&self.reply_to, end_marker, self.priority)
	}

	fn send_terminal(
		&self,
		message_type: MessageType,
		kind: Option<ErrorKind>,
		payload: Bytes,
	) -> Result<(), BrokerError> {
		let mut envelope = self.base_envelope(message_type);
		envelope.error_kind = kind.map(|k| k.as_str().to_string());
		envelope.payload = payload;
		self.producer.send(&self.reply_to, envelope, self.priority)
	}
}

impl<M: 'static> std::fmt::Debug for ResponseContext<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResponseContext")
			.field("call_id", &self.call_id)
			.field("reply_to", &self.reply_to)
			.field("closed", &self.is_closed())
			.finish()
	}
}
