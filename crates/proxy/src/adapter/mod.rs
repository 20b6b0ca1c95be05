//! Broker adapter seam.
//!
//! The proxy talks to its message broker exclusively through [`BrokerAdapter`].
//! Production embedders implement it over a real broker client; [`memory`]
//! provides a complete in-process implementation for tests and loopback use.

use std::collections::HashMap;
use std::sync::Arc;

use relay_proto::{Destination, Envelope, Priority};
use tokio::sync::mpsc;

use crate::error::BrokerError;

pub mod memory;

pub use memory::MemoryBroker;

/// Events delivered through a consumer registration.
#[derive(Debug)]
pub enum ConsumerEvent {
	/// An inbound message on the consumed destination.
	Message(Envelope),
	/// The broker connection failed fatally; no further messages will arrive.
	Fatal(BrokerError),
}

/// Sink handed to the adapter when registering a consumer callback.
///
/// The proxy pulls events from the other end one at a time; an adapter that
/// bridges a real delivery thread should block that thread while the proxy is
/// saturated so unconsumed load stays in the broker.
pub type DeliverySink = mpsc::UnboundedSender<ConsumerEvent>;

/// Sending half of the broker connection.
///
/// One producer is shared by every response context of a proxy; `send` must be
/// callable from any task. Delivery is always non-persistent.
pub trait Producer: Send + Sync + 'static {
	/// Send one message to `destination` at the given priority.
	fn send(
		&self,
		destination: &Destination,
		envelope: Envelope,
		priority: Priority,
	) -> Result<(), BrokerError>;
}

/// Contract the proxy requires from a message broker.
pub trait BrokerAdapter: Send + Sync + 'static {
	/// Establish the underlying connection, applying opaque connection
	/// properties from the proxy configuration.
	fn connect(&self, properties: &HashMap<String, String>) -> Result<(), BrokerError>;

	/// Open a producer with no bound destination.
	fn open_producer(&self) -> Result<Arc<dyn Producer>, BrokerError>;

	/// Register an inbound callback on a named destination.
	fn open_consumer(
		&self,
		destination: &Destination,
		sink: DeliverySink,
	) -> Result<ConsumerHandle, BrokerError>;

	/// Create a transient private destination.
	fn create_temporary_destination(&self) -> Result<Destination, BrokerError>;
}

/// Guard for a consumer registration.
///
/// Dropping the handle detaches the callback, so a consumer can never outlive
/// the context that opened it.
pub struct ConsumerHandle {
	detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ConsumerHandle {
	/// Build a handle from a detach action.
	pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
		Self {
			detach: Some(Box::new(detach)),
		}
	}

	/// Detach the consumer callback now.
	pub fn detach(mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}

impl Drop for ConsumerHandle {
	fn drop(&mut self) {
		if let Some(detach) = self.detach.take() {
			detach();
		}
	}
}

impl std::fmt::Debug for ConsumerHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConsumerHandle")
			.field("attached", &self.detach.is_some())
			.finish()
	}
}
