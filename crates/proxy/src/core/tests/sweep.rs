//! Tests for the call table and its periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use relay_proto::{CallId, Deadline, Destination, Priority, ProtocolVersion};

use super::helpers::{FnHandler, signal, start_proxy, test_config, wait_until};
use crate::adapter::{BrokerAdapter, MemoryBroker};
use crate::core::ResponseContext;
use crate::core::table::{CallTable, ServerContext, UploadInProgress};
use crate::core::upload::UploadContext;
use crate::metrics::ProxyMetrics;
use crate::serializer::JsonSerializer;

fn response_ctx(broker: &MemoryBroker, call_id: &str) -> Arc<ResponseContext<String>> {
	ResponseContext::new(
		CallId::from(call_id),
		Destination::from("client"),
		Deadline::from_now(Duration::from_secs(10)),
		ProtocolVersion::V1,
		Arc::new(JsonSerializer),
		1024,
		Priority::default(),
		broker.open_producer().unwrap(),
		Arc::new(ProxyMetrics::default()),
	)
}

fn upload_ctx(broker: &MemoryBroker, call_id: &str) -> Arc<UploadContext<String>> {
	UploadContext::new(
		CallId::from(call_id),
		broker.create_temporary_destination().unwrap(),
		Destination::from("client"),
		Deadline::from_now(Duration::from_secs(10)),
		ProtocolVersion::V1,
		Arc::new(JsonSerializer),
		Arc::new(ProxyMetrics::default()),
		Box::new(|_| {}),
	)
}

#[tokio::test(flavor = "current_thread")]
async fn promotion_is_atomic_replace() {
	let broker = MemoryBroker::new();
	let table = CallTable::<String>::new();
	let call_id = CallId::from("c1");

	let upload = upload_ctx(&broker, "c1");
	assert!(table.try_insert(&call_id, ServerContext::Upload(upload.clone())));
	assert!(
		!table.try_insert(&call_id, ServerContext::Upload(upload)),
		"one context per call id"
	);

	let response = response_ctx(&broker, "c1");
	table.promote(&call_id, response.clone());
	assert_eq!(table.len(), 1);

	// The promoted entry is what a subsequent signal resolves to.
	let resolved = table
		.signal_context(&call_id, || panic!("must reuse, not create"))
		.unwrap();
	assert!(Arc::ptr_eq(&resolved, &response));
}

#[tokio::test(flavor = "current_thread")]
async fn signal_context_rejects_upload_entry() {
	let broker = MemoryBroker::new();
	let table = CallTable::<String>::new();
	let call_id = CallId::from("c1");

	let upload = upload_ctx(&broker, "c1");
	assert!(table.try_insert(&call_id, ServerContext::Upload(upload)));

	let result = table.signal_context(&call_id, || panic!("must not create"));
	assert_eq!(result.unwrap_err(), UploadInProgress);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sweep_removes_closed_entries() {
	let harness = start_proxy(test_config(), FnHandler::echo());
	let mut replies = harness.subscribe("replies.c1");

	harness.send(signal("c1", "replies.c1", "a"));
	replies.recv().await.expect("response");
	replies.recv().await.expect("end of stream");
	assert_eq!(harness.proxy.table_len(), 1, "closed entry stays until sweep");

	tokio::time::advance(Duration::from_secs(11)).await;

	let mut replies2 = harness.subscribe("replies.c2");
	harness.send(signal("c2", "replies.c2", "b"));
	replies2.recv().await.expect("response");
	replies2.recv().await.expect("end of stream");

	// The sweep that preceded c2 dropped c1's closed context.
	assert_eq!(harness.proxy.table_len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sweep_runs_at_most_every_ten_seconds() {
	let harness = start_proxy(test_config(), FnHandler::echo());

	let mut replies = harness.subscribe("replies.c1");
	harness.send(signal("c1", "replies.c1", "a"));
	replies.recv().await;
	replies.recv().await;

	tokio::time::advance(Duration::from_secs(5)).await;

	let mut replies2 = harness.subscribe("replies.c2");
	harness.send(signal("c2", "replies.c2", "b"));
	replies2.recv().await;
	replies2.recv().await;
	assert_eq!(harness.proxy.table_len(), 2, "guard held the sweep back");

	tokio::time::advance(Duration::from_secs(6)).await;

	let mut replies3 = harness.subscribe("replies.c3");
	harness.send(signal("c3", "replies.c3", "c"));
	replies3.recv().await;
	replies3.recv().await;
	assert_eq!(harness.proxy.table_len(), 1, "both closed entries swept");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn sweep_evicts_expired_context_nobody_wrote_to() {
	let harness = start_proxy(test_config(), FnHandler::echo());

	// The context is installed before payload decode; a malformed payload
	// leaves it behind with no terminal write ever coming.
	let mut envelope = signal("c1", "replies.c1", "ping");
	envelope.deadline = Some(Deadline::from_now(Duration::from_millis(30)));
	envelope.payload = bytes::Bytes::from_static(b"{broken");
	harness.proxy.on_message(envelope).await;

	wait_until(|| harness.proxy.metrics().incompatible_messages == 1).await;
	assert_eq!(harness.proxy.table_len(), 1);

	// Let the wall-clock deadline lapse, then cross the sweep interval.
	std::thread::sleep(Duration::from_millis(50));
	tokio::time::advance(Duration::from_secs(11)).await;

	harness.proxy.on_message(signal("c2", "replies.c2", "ok")).await;
	wait_until(|| harness.proxy.table_len() == 1).await;
}
