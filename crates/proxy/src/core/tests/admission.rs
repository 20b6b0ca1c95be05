//! Tests for bounded admission and permit accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relay_proto::MessageType;

use super::helpers::{FnHandler, Gate, signal, start_proxy, test_config, wait_until};
use crate::config::ProxyConfig;
use crate::error::HandlerError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_call_waits_for_permit() {
	let gate = Arc::new(Gate::default());
	let started = Arc::new(AtomicUsize::new(0));

	let harness = start_proxy(
		ProxyConfig {
			max_concurrent_calls: 1,
			..test_config()
		},
		{
			let gate = gate.clone();
			let started = started.clone();
			FnHandler::new(move |_, responder| {
				started.fetch_add(1, Ordering::SeqCst);
				gate.wait();
				responder.end_of_stream();
				Ok(())
			})
		},
	);

	// First dispatch takes the only permit and parks in the handler.
	harness.proxy.on_message(signal("a", "replies.a", "1")).await;
	wait_until(|| started.load(Ordering::SeqCst) == 1).await;

	// Second dispatch must block in admission, not reach the handler.
	let blocked = {
		let proxy = harness.proxy.clone();
		tokio::spawn(async move {
			proxy.on_message(signal("b", "replies.b", "2")).await;
		})
	};
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(started.load(Ordering::SeqCst), 1);
	assert!(!blocked.is_finished());
	assert_eq!(harness.proxy.metrics().requests_received, 2);

	gate.open();
	blocked.await.unwrap();
	wait_until(|| started.load(Ordering::SeqCst) == 2).await;
}

#[tokio::test(flavor = "current_thread")]
async fn permit_released_after_handler_error() {
	let harness = start_proxy(
		test_config(),
		FnHandler::new(|_, _| Err(HandlerError::new("boom"))),
	);
	let mut replies = harness.subscribe("replies.c1");

	harness.send(signal("c1", "replies.c1", "ping"));

	let terminal = replies.recv().await.expect("terminal error");
	assert_eq!(terminal.message_type, Some(MessageType::Error));
	assert_eq!(terminal.error_kind.as_deref(), Some("handler"));
	assert_eq!(terminal.payload.as_ref(), b"boom");

	assert_eq!(harness.proxy.metrics().errors, 1);
	wait_until(|| harness.proxy.available_permits() == 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_panic_is_contained() {
	let harness = start_proxy(
		test_config(),
		FnHandler::new(|request, responder| {
			if request == "boom" {
				panic!("handler exploded");
			}
			responder.send_response(&request).unwrap();
			responder.end_of_stream();
			Ok(())
		}),
	);
	let mut replies = harness.subscribe("replies.ok");

	harness.send(signal("bad", "replies.bad", "boom"));
	wait_until(|| harness.proxy.available_permits() == 2).await;

	// The proxy keeps serving after the panic.
	harness.send(signal("ok", "replies.ok", "fine"));
	let response = replies.recv().await.expect("response after panic");
	assert_eq!(response.message_type, Some(MessageType::Response));
}

#[tokio::test(flavor = "current_thread")]
async fn incompatible_message_consumes_no_permit() {
	let harness = start_proxy(
		ProxyConfig {
			max_concurrent_calls: 1,
			..test_config()
		},
		FnHandler::echo(),
	);

	let mut envelope = signal("c1", "replies.c1", "ping");
	envelope.version = None;
	harness.proxy.on_message(envelope).await;

	assert_eq!(harness.proxy.available_permits(), 1);
	assert_eq!(harness.proxy.metrics().incompatible_messages, 1);
}
