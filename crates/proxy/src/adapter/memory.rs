//! In-process loopback broker.
//!
//! Destinations are plain names; a send is delivered to the registered
//! consumer, or buffered until one attaches, which matches queue semantics
//! closely enough for tests and single-process embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use relay_proto::{Destination, Envelope, Priority};

use super::{BrokerAdapter, ConsumerEvent, ConsumerHandle, DeliverySink, Producer};
use crate::error::BrokerError;

/// In-process broker adapter.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
	state: Arc<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
	consumers: Mutex<HashMap<Destination, DeliverySink>>,
	/// Messages sent to destinations nobody consumes yet.
	pending: Mutex<HashMap<Destination, VecDeque<ConsumerEvent>>>,
	next_temp: AtomicU64,
}

impl MemoryBroker {
	/// Create a new broker with no destinations.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Report a fatal connection failure to every attached consumer.
	pub fn inject_fatal(&self, reason: &str) {
		let consumers = self.state.consumers.lock().unwrap();
		for sink in consumers.values() {
			let _ = sink.send(ConsumerEvent::Fatal(BrokerError::ConnectionLost(
				reason.to_string(),
			)));
		}
	}

	fn deliver(&self, destination: &Destination, event: ConsumerEvent) -> Result<(), BrokerError> {
		let consumers = self.state.consumers.lock().unwrap();
		match consumers.get(destination) {
			Some(sink) => sink.send(event).map_err(|_| BrokerError::SendFailed {
				destination: destination.to_string(),
				reason: "consumer gone".to_string(),
			}),
			None => {
				self.state
					.pending
					.lock()
					.unwrap()
					.entry(destination.clone())
					.or_default()
					.push_back(event);
				Ok(())
			}
		}
	}
}

impl BrokerAdapter for MemoryBroker {
	fn connect(&self, _properties: &HashMap<String, String>) -> Result<(), BrokerError> {
		Ok(())
	}

	fn open_producer(&self) -> Result<Arc<dyn Producer>, BrokerError> {
		Ok(Arc::new(MemoryProducer {
			broker: self.clone(),
		}))
	}

	fn open_consumer(
		&self,
		destination: &Destination,
		sink: DeliverySink,
	) -> Result<ConsumerHandle, BrokerError> {
		let mut consumers = self.state.consumers.lock().unwrap();
		if consumers.contains_key(destination) {
			return Err(BrokerError::ConsumerUnavailable(format!(
				"destination already consumed: {destination}"
			)));
		}

		// Replay anything buffered before the consumer attached.
		if let Some(backlog) = self.state.pending.lock().unwrap().remove(destination) {
			for event in backlog {
				let _ = sink.send(event);
			}
		}

		consumers.insert(destination.clone(), sink);

		let state = self.state.clone();
		let destination = destination.clone();
		Ok(ConsumerHandle::new(move || {
			state.consumers.lock().unwrap().remove(&destination);
		}))
	}

	fn create_temporary_destination(&self) -> Result<Destination, BrokerError> {
		let n = self.state.next_temp.fetch_add(1, Ordering::Relaxed);
		Ok(Destination(format!("tmp.{n:08x}")))
	}
}

struct MemoryProducer {
	broker: MemoryBroker,
}

impl Producer for MemoryProducer {
	fn send(
		&self,
		destination: &Destination,
		envelope: Envelope,
		_priority: Priority,
	) -> Result<(), BrokerError> {
		self.broker.deliver(destination, ConsumerEvent::Message(envelope))
	}
}
