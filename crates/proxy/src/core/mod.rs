//! Request proxy core: admission, dispatch, call state, and teardown.
//!
//! # Purpose
//!
//! - Define the server-side request proxy that subscribes to a broker
//!   destination, demultiplexes inbound messages into per-call contexts, and
//!   streams handler responses back to each caller's reply destination.
//! - Describe admission control: a counting permit of `max_concurrent_calls`
//!   acquired on the consumer loop before any worker task is submitted.
//! - Define the call state machine: signal-only, upload-in-progress, and
//!   streaming-response phases keyed by correlation id, with at-most-once
//!   promotion and sweep-based cleanup.
//! - Exclude broker connection management, naming, credentials, and the
//!   downstream business handler; those arrive through the [`crate::adapter`]
//!   and [`Handler`] seams.
//!
//! # Mental model
//!
//! - The proxy owns one consumer registration on its listening destination and
//!   one unbound producer shared by every response context.
//! - Each inbound message names a call via its correlation id. The call table
//!   maps that id to exactly one server context: an upload context while a
//!   fragmented request is being collected, a response context afterwards.
//! - Backpressure is the permit: when all workers are busy the consumer loop
//!   parks in `acquire`, stops pulling, and unconsumed load stays in the
//!   broker, which is durable and fair. The process never queues work.
//! - Contexts never point back at the proxy. Upload completion is a callback
//!   holding a weak handle, so the ownership tree is proxy → table → context
//!   and teardown order is never in question.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints |
//! |---|---|---|
//! | [`RequestProxy`] | Facade over the shared proxy state | MUST be the only entry point for lifecycle and inbound messages |
//! | [`ProxyInner`] | Shared state behind an `Arc` | MUST keep metrics and call table per-instance; no module-level state |
//! | [`table::CallTable`] | correlation id → active context | MUST hold at most one context per id; promotion is a single map insert |
//! | [`ResponseContext`] | Reply sink for one call | MUST serialize writes; MUST drop writes after close |
//! | [`upload::UploadContext`] | Reassembly state for one upload | MUST complete at most once; MUST detach its consumer when it closes |
//! | [`ListenerId`] | Membership handle for lifecycle listeners | Snapshot iteration MUST tolerate removal from within a callback |
//!
//! # Invariants
//!
//! 1. The permit MUST be acquired on the consumer loop before the worker task
//!    is submitted; submitting first loses the backpressure property.
//!    - Enforced in: `ProxyInner::on_message`
//!    - Tested by: `core::tests::admission::second_call_waits_for_permit`
//!    - Failure symptom: unbounded task queue; broker sees the proxy as
//!      infinitely fast and keeps delivering.
//! 2. Handler invocations in progress MUST never exceed `max_concurrent_calls`,
//!    including invocations that originate from upload completion.
//!    - Enforced in: `ProxyInner::on_message`, `ProxyInner::spawn_upload_completion`
//!    - Tested by: `core::tests::admission`
//!    - Failure symptom: more concurrent handler calls than configured, and
//!      upload-heavy traffic bypasses admission entirely.
//! 3. Every permit MUST be released exactly once, on success, error, or panic.
//!    - Enforced in: owned permits moved into worker tasks (drop releases)
//!    - Tested by: `core::tests::admission::permit_released_after_handler_error`
//!    - Failure symptom: permit leak; the proxy wedges at a lower concurrency
//!      until restart.
//! 4. The call table MUST hold at most one context per correlation id, and
//!    upload-to-response promotion MUST be atomic.
//!    - Enforced in: `CallTable::signal_context`, `CallTable::try_insert`, `CallTable::promote`
//!    - Tested by: `core::tests::sweep::promotion_is_atomic_replace`
//!    - Failure symptom: responses for one call interleave across two
//!      contexts, or a gap lets the sweep drop an in-flight call.
//! 5. A message whose deadline has passed MUST NOT reach the handler.
//!    - Enforced in: `ProxyInner::on_message`
//!    - Tested by: `core::tests::signal::expired_request_is_dropped`
//!    - Failure symptom: work performed for clients that gave up long ago.
//! 6. Responses for one call MUST leave in `send_response` order, and a closed
//!    context MUST drop later writes silently without re-counting *error*.
//!    - Enforced in: `ResponseContext::send_response`, `ResponseContext::report_error`
//!    - Tested by: `core::tests::response`
//!    - Failure symptom: out-of-order replies, or metrics inflated by late
//!      handlers.
//! 7. The sweep MUST run at most once per ten seconds, MUST use a monotonic
//!    clock, and MUST be the only remover of entries in normal operation.
//!    - Enforced in: `CallTable::maybe_sweep`
//!    - Tested by: `core::tests::sweep`
//!    - Failure symptom: table churn on every message, or clock regression
//!      deferring cleanup indefinitely.
//! 8. After `stop` returns, no new handler invocation begins; in-flight
//!    handlers get at most `shutdown_timeout`, then are abandoned. Close
//!    listeners fire exactly once.
//!    - Enforced in: `ProxyInner::stop`, the `stopping` flag, `TaskTracker`
//!    - Tested by: `core::tests::lifecycle`
//!    - Failure symptom: shutdown hangs on a stuck handler, or listeners fire
//!      twice when a broker fatal races an explicit stop.
//! 9. Worker failures MUST be mapped to the metrics taxonomy inside the task;
//!    nothing crosses the pool boundary.
//!    - Enforced in: `ProxyInner::dispatch`
//!    - Tested by: `core::tests::admission::handler_panic_is_contained`
//!    - Failure symptom: one bad message takes down the consumer loop.
//!
//! # Data flow
//!
//! 1. The adapter pushes [`crate::adapter::ConsumerEvent`]s into the sink
//!    registered at `start`; the consumer loop drains it one event at a time.
//! 2. `on_message` sweeps opportunistically, counts the request, and gates on
//!    protocol version and deadline before acquiring a permit.
//! 3. The worker classifies by `x-msg-type`: a `signal` resolves or creates a
//!    response context and invokes the handler; a `channel-request` allocates
//!    a private destination, installs an upload context, and advertises the
//!    destination back to the caller.
//! 4. Fragments arrive on the private destination. On the last fragment or an
//!    explicit `channel-end`, the upload completes: a response context
//!    replaces the upload entry, and the handler runs under a fresh permit.
//! 5. Responses written through the context are serialized, fragmented when
//!    oversized, and sent to the caller's reply destination, ending with
//!    `end-of-stream` or a terminal `error`.
//!
//! # Concurrency and ordering
//!
//! - The call table and listener sets are the only shared mutable maps; all
//!   access is lock-per-operation, never across a send or an await.
//! - Per-context write locks order responses within a call; no ordering is
//!   promised across calls.
//! - The sweep serializes with itself through its timestamp guard and runs
//!   concurrently with inserts and promotions.
//!
//! # Failure modes and recovery
//!
//! - Unknown version or serializer, malformed headers: counted incompatible,
//!   dropped; the client's own timeout is the recovery path.
//! - Handler error: counted, terminal `error` message, context closed; the
//!   proxy keeps serving.
//! - Broker send failure: counted, that call closes, the proxy keeps serving.
//! - Broker fatal: counted, `stop` scheduled off the delivery path; in-flight
//!   calls get the usual grace period.

mod dispatch;
mod lifecycle;
mod response;
mod table;
mod upload;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use lifecycle::ListenerId;
use relay_proto::Envelope;
pub use response::ResponseContext;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::adapter::{BrokerAdapter, ConsumerHandle, Producer};
use crate::config::ProxyConfig;
use crate::error::{BrokerError, ConfigError, HandlerError};
use crate::metrics::{MetricsSnapshot, ProxyMetrics};
use crate::serializer::SerializerRegistry;

/// Downstream request handler.
///
/// `handle` is invoked once per complete request with the response context as
/// its reply sink. It must not block its caller for the duration of the call:
/// either complete synchronously, writing responses and end-of-stream, or
/// spawn your own work and return.
pub trait Handler: Send + Sync + 'static {
	/// Domain message type for requests and responses of this handler.
	type Message: Send + 'static;

	/// Process one request.
	fn handle(
		&self,
		request: Self::Message,
		responder: Arc<ResponseContext<Self::Message>>,
	) -> Result<(), HandlerError>;
}

/// Server-side request proxy over a message broker.
///
/// Cheap to clone; all clones share one proxy instance.
pub struct RequestProxy<H: Handler> {
	inner: Arc<ProxyInner<H>>,
}

impl<H: Handler> Clone for RequestProxy<H> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

pub(crate) struct ProxyInner<H: Handler> {
	config: ProxyConfig,
	adapter: Arc<dyn BrokerAdapter>,
	handler: H,
	serializers: SerializerRegistry<H::Message>,
	metrics: Arc<ProxyMetrics>,
	table: table::CallTable<H::Message>,
	/// The sole gate on in-flight concurrency.
	permits: Arc<Semaphore>,
	/// Shutdown barrier over worker tasks and fragment listeners.
	tracker: TaskTracker,
	producer: Mutex<Option<Arc<dyn Producer>>>,
	lifecycle: Mutex<LifecycleState>,
	stopping: AtomicBool,
	shutdown: CancellationToken,
	connection_listeners: lifecycle::ListenerSet,
	close_listeners: lifecycle::ListenerSet,
}

#[derive(Default)]
struct LifecycleState {
	running: bool,
	consumer: Option<ConsumerHandle>,
	consumer_loop: Option<JoinHandle<()>>,
}

impl<H: Handler> RequestProxy<H> {
	/// Build a proxy from its configuration and collaborators.
	pub fn new(
		config: ProxyConfig,
		adapter: Arc<dyn BrokerAdapter>,
		serializers: SerializerRegistry<H::Message>,
		handler: H,
	) -> Result<Self, ConfigError> {
		config.validate()?;

		let permits = Arc::new(Semaphore::new(config.max_concurrent_calls));
		Ok(Self {
			inner: Arc::new(ProxyInner {
				config,
				adapter,
				handler,
				serializers,
				metrics: Arc::new(ProxyMetrics::default()),
				table: table::CallTable::new(),
				permits,
				tracker: TaskTracker::new(),
				producer: Mutex::new(None),
				lifecycle: Mutex::new(LifecycleState::default()),
				stopping: AtomicBool::new(false),
				shutdown: CancellationToken::new(),
				connection_listeners: lifecycle::ListenerSet::default(),
				close_listeners: lifecycle::ListenerSet::default(),
			}),
		})
	}

	/// Connect to the broker, open the producer and consumer, and begin
	/// consuming. Idempotent while running; notifies connection listeners.
	///
	/// Must be called from within a tokio runtime.
	pub fn start(&self) -> Result<(), BrokerError> {
		self.inner.start()
	}

	/// Detach from the broker and wind down in-flight calls.
	pub async fn stop(&self) {
		self.inner.stop().await;
	}

	/// Feed one inbound message to the dispatcher.
	///
	/// Normally driven by the consumer loop; public so embedders and tests can
	/// deliver messages directly.
	pub async fn on_message(&self, envelope: Envelope) {
		self.inner.on_message(envelope).await;
	}

	/// Snapshot of the proxy counters.
	#[must_use]
	pub fn metrics(&self) -> MetricsSnapshot {
		self.inner.metrics.snapshot()
	}

	/// Register a callback fired when the proxy attaches to the broker.
	pub fn add_connection_listener(
		&self,
		listener: impl Fn() + Send + Sync + 'static,
	) -> ListenerId {
		self.inner.connection_listeners.add(listener)
	}

	/// Remove a connection listener. Returns false if it was not registered.
	pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
		self.inner.connection_listeners.remove(id)
	}

	/// Register a callback fired exactly once when the proxy stops.
	pub fn add_close_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerId {
		self.inner.close_listeners.add(listener)
	}

	/// Remove a close listener. Returns false if it was not registered.
	pub fn remove_close_listener(&self, id: ListenerId) -> bool {
		self.inner.close_listeners.remove(id)
	}
}

impl<H: Handler> ProxyInner<H> {
	fn stopping(&self) -> bool {
		self.stopping.load(Ordering::SeqCst)
	}

	fn producer(&self) -> Option<Arc<dyn Producer>> {
		self.producer.lock().unwrap().clone()
	}
}

#[cfg(test)]
impl<H: Handler> RequestProxy<H> {
	pub(crate) fn available_permits(&self) -> usize {
		self.inner.permits.available_permits()
	}

	pub(crate) fn table_len(&self) -> usize {
		self.inner.table.len()
	}
}

#[cfg(test)]
mod tests;
