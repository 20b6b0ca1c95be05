//! Fragmented-upload context for one call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use relay_proto::{CallId, Deadline, Destination, Envelope, MessageType, ProtocolVersion};

use crate::adapter::ConsumerHandle;
use crate::metrics::ProxyMetrics;
use crate::serializer::Serializer;

/// Completion callback invoked once an upload is fully reassembled.
///
/// Supplied at construction so the context never holds a reference back into
/// the proxy; the proxy side captures a weak handle of itself.
pub(crate) type UploadComplete<M> = Box<dyn Fn(CompletedUpload<M>) + Send + Sync>;

/// A fully reassembled upload, ready for promotion and dispatch.
pub(crate) struct CompletedUpload<M> {
	pub(crate) call_id: CallId,
	pub(crate) payload: Bytes,
	pub(crate) reply_to: Destination,
	pub(crate) deadline: Deadline,
	pub(crate) version: ProtocolVersion,
	pub(crate) serializer: Arc<dyn Serializer<M>>,
}

/// Receiving side of one fragmented upload.
///
/// Fragments arrive on a private temporary destination, each carrying its
/// sequence index and the total count. Buffers are sequence-indexed, so
/// out-of-order and duplicated fragments are harmless. Completion fires on
/// the last fragment or on an explicit `channel-end`; a deadline that elapses
/// first closes the context and the sweep reclaims it.
pub(crate) struct UploadContext<M> {
	call_id: CallId,
	upload_destination: Destination,
	reply_to: Destination,
	deadline: Deadline,
	version: ProtocolVersion,
	serializer: Arc<dyn Serializer<M>>,
	metrics: Arc<ProxyMetrics>,
	state: Mutex<UploadState>,
	closed: AtomicBool,
	complete: UploadComplete<M>,
	consumer: Mutex<Option<ConsumerHandle>>,
}

#[derive(Default)]
struct UploadState {
	fragments: BTreeMap<u32, Bytes>,
	expected_total: Option<u32>,
}

impl<M> UploadContext<M> {
	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		call_id: CallId,
		upload_destination: Destination,
		reply_to: Destination,
		deadline: Deadline,
		version: ProtocolVersion,
		serializer: Arc<dyn Serializer<M>>,
		metrics: Arc<ProxyMetrics>,
		complete: UploadComplete<M>,
	) -> Arc<Self> {
		Arc::new(Self {
			call_id,
			upload_destination,
			reply_to,
			deadline,
			version,
			serializer,
			metrics,
			state: Mutex::new(UploadState::default()),
			closed: AtomicBool::new(false),
			complete,
			consumer: Mutex::new(None),
		})
	}

	pub(crate) fn upload_destination(&self) -> &Destination {
		&self.upload_destination
	}

	/// Store the fragment-listener registration so it detaches with the call.
	pub(crate) fn attach_consumer(&self, handle: ConsumerHandle) {
		*self.consumer.lock().unwrap() = Some(handle);
	}

	/// True once completed, failed, torn down, or past the deadline.
	pub(crate) fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire) || self.deadline.has_passed()
	}

	/// Close without completing. Teardown and error paths.
	pub(crate) fn force_close(&self) {
		self.closed.store(true, Ordering::Release);
		self.detach();
	}

	/// Process one message from the private upload destination.
	pub(crate) fn on_fragment(&self, envelope: Envelope) {
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		if self.deadline.has_passed() {
			tracing::debug!(call_id = %self.call_id, "upload deadline elapsed; closing");
			self.force_close();
			return;
		}

		match envelope.message_type {
			Some(MessageType::ChannelUpload) => self.store_fragment(envelope),
			Some(MessageType::ChannelEnd) => self.finish_on_end(),
			_ => self.metrics.incompatible_message(),
		}
	}

	fn store_fragment(&self, envelope: Envelope) {
		let Some(index) = envelope.fragment_index else {
			self.metrics.incompatible_message();
			return;
		};

		let ready = {
			let mut state = self.state.lock().unwrap();

			if let Some(total) = envelope.fragment_total {
				match state.expected_total {
					Some(expected) if expected != total => {
						drop(state);
						tracing::warn!(
							call_id = %self.call_id,
							expected,
							got = total,
							"upload fragment count changed mid-stream; dropping call"
						);
						self.metrics.error();
						self.force_close();
						return;
					}
					_ => state.expected_total = Some(total),
				}
			}

			state.fragments.insert(index, envelope.payload);
			state.expected_total
				.is_some_and(|total| state.fragments.len() == total as usize)
		};

		if ready {
			self.finish(self.assemble());
		}
	}

	fn finish_on_end(&self) {
		let complete = {
			let state = self.state.lock().unwrap();
			let contiguous = state
				.fragments
				.keys()
				.copied()
				.eq(0..state.fragments.len() as u32);
			contiguous
				&& state
					.expected_total
					.is_none_or(|total| state.fragments.len() == total as usize)
		};

		if complete {
			self.finish(self.assemble());
		} else {
			// Ending an upload with holes would hand the handler a corrupted
			// request; fail the call instead.
			tracing::warn!(call_id = %self.call_id, "channel-end before all fragments arrived");
			self.metrics.error();
			self.force_close();
		}
	}

	fn assemble(&self) -> Bytes {
		let state = self.state.lock().unwrap();
		let len = state.fragments.values().map(Bytes::len).sum();
		let mut payload = BytesMut::with_capacity(len);
		for fragment in state.fragments.values() {
			payload.extend_from_slice(fragment);
		}
		payload.freeze()
	}

	fn finish(&self, payload: Bytes) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.detach();
		(self.complete)(CompletedUpload {
			call_id: self.call_id.clone(),
			payload,
			reply_to: self.reply_to.clone(),
			deadline: self.deadline,
			version: self.version,
			serializer: self.serializer.clone(),
		});
	}

	fn detach(&self) {
		if let Some(handle) = self.consumer.lock().unwrap().take() {
			handle.detach();
		}
	}
}

impl<M> std::fmt::Debug for UploadContext<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("UploadContext")
			.field("call_id", &self.call_id)
			.field("upload_destination", &self.upload_destination)
			.field("closed", &self.is_closed())
			.finish()
	}
}
