//! Inbound message admission and dispatch.

use std::sync::Arc;

use relay_proto::{CallId, Deadline, Destination, Envelope, MessageType, ProtocolVersion};
use tokio::sync::mpsc;

use super::response::ResponseContext;
use super::table::ServerContext;
use super::upload::{CompletedUpload, UploadComplete, UploadContext};
use super::{Handler, ProxyInner};
use crate::adapter::ConsumerEvent;
use crate::error::{BrokerError, ErrorKind};
use crate::serializer::Serializer;

impl<H: Handler> ProxyInner<H> {
	/// Entry point for every message on the listening destination.
	///
	/// Admission control happens here, on the consumer loop: the permit is
	/// acquired before the worker task is submitted, so a saturated proxy
	/// stops pulling and unconsumed load stays in the broker.
	pub(super) async fn on_message(self: &Arc<Self>, envelope: Envelope) {
		if self.stopping() {
			return;
		}

		self.table.maybe_sweep();
		self.metrics.request_received();

		if !envelope.version.is_some_and(ProtocolVersion::is_supported) {
			self.metrics.incompatible_message();
			return;
		}
		let Some(deadline) = envelope.deadline else {
			self.metrics.incompatible_message();
			return;
		};
		if deadline.has_passed() {
			self.metrics.request_timeout();
			return;
		}

		// Backpressure: this await blocks the consumer loop until a worker
		// slot frees up. Err means the semaphore was closed by `stop`.
		let Ok(permit) = self.permits.clone().acquire_owned().await else {
			return;
		};

		let proxy = self.clone();
		self.tracker.spawn(async move {
			let _permit = permit; // released when the task ends, however it ends
			proxy.dispatch(envelope, deadline);
		});
	}

	/// Worker-side classification and error shell.
	///
	/// Failures are mapped to the metrics taxonomy here; nothing escapes to
	/// the pool.
	fn dispatch(self: &Arc<Self>, envelope: Envelope, deadline: Deadline) {
		let result = match envelope.message_type {
			Some(MessageType::Signal) => self.handle_signal(envelope, deadline),
			Some(MessageType::ChannelRequest) => self.handle_channel_request(envelope, deadline),
			_ => {
				self.metrics.incompatible_message();
				Ok(())
			}
		};

		if let Err(e) = result {
			self.metrics.error();
			tracing::warn!(error = %e, "dispatch failed");
		}
	}

	fn handle_signal(self: &Arc<Self>, envelope: Envelope, deadline: Deadline) -> Result<(), BrokerError> {
		let (Some(call_id), Some(reply_to)) = (envelope.call_id.clone(), envelope.reply_to.clone())
		else {
			// Malformed: drop silently, the client relies on its own timeout.
			tracing::debug!("signal without call id or reply destination");
			return Ok(());
		};
		let Some((serializer, version)) = self.resolve_codec(&envelope) else {
			return Ok(());
		};
		let Some(producer) = self.producer() else {
			self.metrics.error();
			return Ok(());
		};

		let context = {
			let serializer = serializer.clone();
			match self.table.signal_context(&call_id, || {
				ResponseContext::new(
					call_id.clone(),
					reply_to,
					deadline,
					version,
					serializer,
					self.config.max_message_size,
					self.config.priority,
					producer,
					self.metrics.clone(),
				)
			}) {
				Ok(context) => context,
				Err(_) => {
					// A plain signal while an upload holds the call id is a
					// protocol violation; completing either would corrupt the
					// other, so the signal is dropped.
					self.metrics.error();
					tracing::warn!(call_id = %call_id, "signal received while upload in progress");
					return Ok(());
				}
			}
		};

		let request = match serializer.deserialize(&envelope.payload) {
			Ok(request) => request,
			Err(e) => {
				self.metrics.incompatible_message();
				tracing::warn!(call_id = %call_id, error = %e, "request payload decode failed");
				return Ok(());
			}
		};

		self.invoke_handler(request, context);
		Ok(())
	}

	fn handle_channel_request(
		self: &Arc<Self>,
		envelope: Envelope,
		deadline: Deadline,
	) -> Result<(), BrokerError> {
		let (Some(call_id), Some(reply_to)) = (envelope.call_id.clone(), envelope.reply_to.clone())
		else {
			self.metrics.incompatible_message();
			return Ok(());
		};
		if self.table.get(&call_id).is_some() {
			// Duplicate announcement for an in-flight call; the first one won,
			// and a retry must not touch any counter.
			return Ok(());
		}
		let Some((serializer, version)) = self.resolve_codec(&envelope) else {
			return Ok(());
		};

		self.metrics.upload_requested();

		let upload_destination = self.adapter.create_temporary_destination()?;

		let weak = Arc::downgrade(self);
		let complete: UploadComplete<H::Message> = Box::new(move |done| {
			if let Some(proxy) = weak.upgrade() {
				proxy.spawn_upload_completion(done);
			}
		});

		let context = UploadContext::new(
			call_id.clone(),
			upload_destination.clone(),
			reply_to.clone(),
			deadline,
			version,
			serializer,
			self.metrics.clone(),
			complete,
		);

		// Arm the fragment listener before advertising the destination, so no
		// fragment can race the registration.
		let (tx, rx) = mpsc::unbounded_channel();
		let handle = self.adapter.open_consumer(&upload_destination, tx)?;
		context.attach_consumer(handle);

		if !self.table.try_insert(&call_id, ServerContext::Upload(context.clone())) {
			// Lost the race to a concurrent announcement.
			context.force_close();
			return Ok(());
		}

		self.spawn_fragment_listener(context, rx);
		self.advertise_upload(&call_id, &reply_to, &upload_destination, version, deadline)?;
		Ok(())
	}

	/// Promotion and dispatch once an upload is fully reassembled.
	fn on_upload_completed(self: &Arc<Self>, done: CompletedUpload<H::Message>) {
		let Some(producer) = self.producer() else {
			return;
		};

		let context = ResponseContext::new(
			done.call_id.clone(),
			done.reply_to,
			done.deadline,
			done.version,
			done.serializer.clone(),
			self.config.max_message_size,
			self.config.priority,
			producer,
			self.metrics.clone(),
		);
		self.table.promote(&done.call_id, context.clone());
		self.metrics.upload_completed();

		let request = match done.serializer.deserialize(&done.payload) {
			Ok(request) => request,
			Err(e) => {
				self.metrics.incompatible_message();
				tracing::warn!(call_id = %done.call_id, error = %e, "reassembled payload decode failed");
				return;
			}
		};

		self.invoke_handler(request, context);
	}

	/// Run upload completion under a worker permit.
	///
	/// Keeps the concurrency bound intact: handler invocations for uploads
	/// compete for the same permits as plain signals.
	fn spawn_upload_completion(self: &Arc<Self>, done: CompletedUpload<H::Message>) {
		let proxy = self.clone();
		self.tracker.spawn(async move {
			let Ok(permit) = proxy.permits.clone().acquire_owned().await else {
				return;
			};
			let _permit = permit;
			proxy.on_upload_completed(done);
		});
	}

	fn spawn_fragment_listener(
		self: &Arc<Self>,
		context: Arc<UploadContext<H::Message>>,
		mut rx: mpsc::UnboundedReceiver<ConsumerEvent>,
	) {
		self.tracker.spawn(async move {
			while let Some(event) = rx.recv().await {
				match event {
					ConsumerEvent::Message(envelope) => context.on_fragment(envelope),
					ConsumerEvent::Fatal(_) => {
						context.force_close();
						break;
					}
				}
				if context.is_closed() {
					break;
				}
			}
		});
	}

	fn advertise_upload(
		&self,
		call_id: &CallId,
		reply_to: &Destination,
		upload_destination: &Destination,
		version: ProtocolVersion,
		deadline: Deadline,
	) -> Result<(), BrokerError> {
		let Some(producer) = self.producer() else {
			self.metrics.error();
			return Ok(());
		};

		let mut advert = Envelope::new(MessageType::ChannelRequest);
		advert.call_id = Some(call_id.clone());
		advert.reply_to = Some(upload_destination.clone());
		advert.version = Some(version);
		advert.deadline = Some(deadline);
		advert.fragment_max = Some(self.config.max_message_size as u32);
		producer.send(reply_to, advert, self.config.priority)
	}

	fn invoke_handler(
		&self,
		request: H::Message,
		context: Arc<ResponseContext<H::Message>>,
	) {
		if let Err(e) = self.handler.handle(request, context.clone()) {
			tracing::warn!(call_id = %context.call_id(), error = %e, "handler failed");
			context.report_error(ErrorKind::Handler, &e.to_string());
		}
	}

	/// Resolve the serializer and version for an inbound message, counting
	/// unknown codecs as incompatible.
	fn resolve_codec(
		&self,
		envelope: &Envelope,
	) -> Option<(Arc<dyn Serializer<H::Message>>, ProtocolVersion)> {
		let version = envelope.version?;
		match envelope
			.serializer_id
			.as_deref()
			.and_then(|id| self.serializers.get(id))
		{
			Some(serializer) => Some((serializer, version)),
			None => {
				self.metrics.incompatible_message();
				tracing::debug!(serializer = ?envelope.serializer_id, "unknown serializer id");
				None
			}
		}
	}
}
