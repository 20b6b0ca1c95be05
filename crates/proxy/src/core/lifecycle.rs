//! Proxy lifecycle: start, stop, and the listener sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Handler, ProxyInner};
use crate::adapter::ConsumerEvent;
use crate::error::BrokerError;

/// Identifier for a registered lifecycle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Small set of lifecycle callbacks with membership semantics.
///
/// Iteration snapshots the set, so a callback may remove itself (or any
/// other listener) without upsetting the walk.
#[derive(Default)]
pub(crate) struct ListenerSet {
	next_id: AtomicU64,
	entries: Mutex<HashMap<u64, Arc<dyn Fn() + Send + Sync>>>,
}

impl ListenerSet {
	pub(crate) fn add(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.entries.lock().unwrap().insert(id, Arc::new(listener));
		ListenerId(id)
	}

	pub(crate) fn remove(&self, id: ListenerId) -> bool {
		self.entries.lock().unwrap().remove(&id.0).is_some()
	}

	pub(crate) fn notify(&self) {
		let snapshot: Vec<_> = self.entries.lock().unwrap().values().cloned().collect();
		for listener in snapshot {
			listener();
		}
	}
}

impl<H: Handler> ProxyInner<H> {
	/// Open the broker side and begin consuming.
	///
	/// Idempotent: a second `start` on a running proxy is a no-op.
	pub(super) fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
		{
			let mut lifecycle = self.lifecycle.lock().unwrap();
			if lifecycle.running {
				return Ok(());
			}

			self.adapter.connect(&self.config.connection_properties)?;
			let producer = self.adapter.open_producer()?;

			let (tx, rx) = mpsc::unbounded_channel();
			let consumer = self.adapter.open_consumer(&self.config.destination, tx)?;

			*self.producer.lock().unwrap() = Some(producer);
			lifecycle.consumer = Some(consumer);
			lifecycle.running = true;

			let proxy = self.clone();
			let token = self.shutdown.clone();
			lifecycle.consumer_loop = Some(tokio::spawn(async move {
				proxy.consume_loop(rx, token).await;
			}));
		}

		tracing::info!(destination = %self.config.destination, "request proxy listening");
		self.connection_listeners.notify();
		Ok(())
	}

	/// Drain the consumer sink into the dispatcher.
	///
	/// Ends on teardown, on a fatal broker event, or when the adapter drops
	/// the sink.
	async fn consume_loop(
		self: Arc<Self>,
		mut rx: mpsc::UnboundedReceiver<ConsumerEvent>,
		token: CancellationToken,
	) {
		loop {
			tokio::select! {
				_ = token.cancelled() => break,
				event = rx.recv() => match event {
					Some(ConsumerEvent::Message(envelope)) => self.on_message(envelope).await,
					Some(ConsumerEvent::Fatal(e)) => {
						self.metrics.error();
						tracing::error!(error = %e, "fatal broker error; scheduling stop");
						// Teardown must not run on the delivery path.
						let proxy = self.clone();
						tokio::spawn(async move {
							proxy.stop().await;
						});
						break;
					}
					None => break,
				},
			}
		}
	}

	/// Detach from the broker and wind down workers.
	///
	/// New messages are refused immediately; in-flight calls get
	/// `shutdown_timeout` to finish before they are abandoned. Close
	/// listeners fire exactly once no matter how many times `stop` runs or
	/// races the broker-fatal path.
	pub(super) async fn stop(self: &Arc<Self>) {
		if self.stopping.swap(true, Ordering::SeqCst) {
			return;
		}

		let (consumer, consumer_loop) = {
			let mut lifecycle = self.lifecycle.lock().unwrap();
			lifecycle.running = false;
			(lifecycle.consumer.take(), lifecycle.consumer_loop.take())
		};
		if let Some(consumer) = consumer {
			consumer.detach();
		}

		self.shutdown.cancel();
		// Unblocks a consumer loop parked on permit acquisition.
		self.permits.close();
		if let Some(handle) = consumer_loop {
			let _ = handle.await;
		}

		self.table.close_uploads();

		self.tracker.close();
		let grace = self.config.shutdown_timeout;
		if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
			tracing::warn!(
				timeout_ms = grace.as_millis() as u64,
				"shutdown grace period elapsed; abandoning in-flight calls"
			);
		}

		self.table.close_all();
		*self.producer.lock().unwrap() = None;

		tracing::info!("request proxy stopped");
		self.close_listeners.notify();
	}
}
