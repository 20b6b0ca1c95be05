//! Common test utilities and helpers.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use relay_proto::{CallId, Deadline, Destination, Envelope, MessageType, ProtocolVersion};
use tokio::sync::mpsc;

use crate::adapter::{BrokerAdapter, ConsumerEvent, ConsumerHandle, MemoryBroker};
use crate::config::ProxyConfig;
use crate::core::{Handler, RequestProxy, ResponseContext};
use crate::error::HandlerError;
use crate::serializer::{JsonSerializer, Serializer, SerializerRegistry};

/// Destination the test proxy listens on.
pub const LISTEN: &str = "relay.test.requests";

type HandlerFn =
	dyn Fn(String, Arc<ResponseContext<String>>) -> Result<(), HandlerError> + Send + Sync;

/// Handler backed by a closure.
pub struct FnHandler(Box<HandlerFn>);

impl FnHandler {
	pub fn new(
		f: impl Fn(String, Arc<ResponseContext<String>>) -> Result<(), HandlerError>
		+ Send
		+ Sync
		+ 'static,
	) -> Self {
		Self(Box::new(f))
	}

	/// Echoes `<request>:ok` and ends the stream.
	pub fn echo() -> Self {
		Self::new(|request, responder| {
			let _ = responder.send_response(&format!("{request}:ok"));
			responder.end_of_stream();
			Ok(())
		})
	}
}

impl Handler for FnHandler {
	type Message = String;

	fn handle(
		&self,
		request: String,
		responder: Arc<ResponseContext<String>>,
	) -> Result<(), HandlerError> {
		(self.0)(request, responder)
	}
}

/// A running proxy over a memory broker.
pub struct TestProxy {
	pub broker: MemoryBroker,
	pub proxy: RequestProxy<FnHandler>,
}

pub fn test_config() -> ProxyConfig {
	ProxyConfig {
		destination: Destination::from(LISTEN),
		max_concurrent_calls: 2,
		shutdown_timeout: Duration::from_millis(250),
		..ProxyConfig::default()
	}
}

pub fn build_proxy(config: ProxyConfig, handler: FnHandler) -> TestProxy {
	let broker = MemoryBroker::new();
	let registry = SerializerRegistry::new(vec![Arc::new(JsonSerializer)]).unwrap();
	let proxy = RequestProxy::new(config, Arc::new(broker.clone()), registry, handler).unwrap();
	TestProxy { broker, proxy }
}

pub fn start_proxy(config: ProxyConfig, handler: FnHandler) -> TestProxy {
	let harness = build_proxy(config, handler);
	harness.proxy.start().unwrap();
	harness
}

impl TestProxy {
	/// Attach a capturing consumer to a destination, as a client would.
	pub fn subscribe(&self, destination: &str) -> ReplyStream {
		let (tx, rx) = mpsc::unbounded_channel();
		let handle = self
			.broker
			.open_consumer(&Destination::from(destination), tx)
			.unwrap();
		ReplyStream {
			_handle: handle,
			rx,
		}
	}

	/// Send an envelope to the proxy's listening destination.
	pub fn send(&self, envelope: Envelope) {
		self.send_to(&Destination::from(LISTEN), envelope);
	}

	pub fn send_to(&self, destination: &Destination, envelope: Envelope) {
		let producer = self.broker.open_producer().unwrap();
		producer
			.send(destination, envelope, Default::default())
			.unwrap();
	}
}

/// Captures messages arriving on one destination.
pub struct ReplyStream {
	_handle: ConsumerHandle,
	rx: mpsc::UnboundedReceiver<ConsumerEvent>,
}

impl ReplyStream {
	/// Wait up to one second for the next message.
	pub async fn recv(&mut self) -> Option<Envelope> {
		match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
			Ok(Some(ConsumerEvent::Message(envelope))) => Some(envelope),
			_ => None,
		}
	}

	pub fn try_recv(&mut self) -> Option<Envelope> {
		match self.rx.try_recv() {
			Ok(ConsumerEvent::Message(envelope)) => Some(envelope),
			_ => None,
		}
	}
}

pub fn encode(value: &str) -> Bytes {
	Serializer::<String>::serialize(&JsonSerializer, &value.to_string()).unwrap()
}

pub fn decode(payload: &[u8]) -> String {
	Serializer::<String>::deserialize(&JsonSerializer, payload).unwrap()
}

/// A well-formed signal with a generous deadline.
pub fn signal(call_id: &str, reply_to: &str, payload: &str) -> Envelope {
	let mut envelope = Envelope::new(MessageType::Signal);
	envelope.call_id = Some(CallId::from(call_id));
	envelope.reply_to = Some(Destination::from(reply_to));
	envelope.serializer_id = Some("json".into());
	envelope.version = Some(ProtocolVersion::V1);
	envelope.deadline = Some(Deadline::from_now(Duration::from_secs(10)));
	envelope.payload = encode(payload);
	envelope
}

/// A well-formed upload announcement.
pub fn channel_request(call_id: &str, reply_to: &str) -> Envelope {
	let mut envelope = Envelope::new(MessageType::ChannelRequest);
	envelope.call_id = Some(CallId::from(call_id));
	envelope.reply_to = Some(Destination::from(reply_to));
	envelope.serializer_id = Some("json".into());
	envelope.version = Some(ProtocolVersion::V1);
	envelope.deadline = Some(Deadline::from_now(Duration::from_secs(10)));
	envelope
}

pub fn upload_fragment(call_id: &str, index: u32, total: Option<u32>, payload: Bytes) -> Envelope {
	let mut envelope = Envelope::new(MessageType::ChannelUpload);
	envelope.call_id = Some(CallId::from(call_id));
	envelope.version = Some(ProtocolVersion::V1);
	envelope.fragment_index = Some(index);
	envelope.fragment_total = total;
	envelope.payload = payload;
	envelope
}

pub fn channel_end(call_id: &str) -> Envelope {
	let mut envelope = Envelope::new(MessageType::ChannelEnd);
	envelope.call_id = Some(CallId::from(call_id));
	envelope.version = Some(ProtocolVersion::V1);
	envelope
}

/// Poll a condition until it holds, or panic after ~2 seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
	for _ in 0..200 {
		if cond() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached in time");
}

/// Blocking gate for handlers that must hold their worker.
#[derive(Default)]
pub struct Gate {
	open: Mutex<bool>,
	cv: Condvar,
}

impl Gate {
	pub fn wait(&self) {
		let mut open = self.open.lock().unwrap();
		while !*open {
			open = self.cv.wait(open).unwrap();
		}
	}

	pub fn open(&self) {
		*self.open.lock().unwrap() = true;
		self.cv.notify_all();
	}
}
