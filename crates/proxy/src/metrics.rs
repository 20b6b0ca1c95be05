//! Proxy counters and their pull-style snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by one proxy instance.
///
/// All counters are monotonic; readers pull a [`MetricsSnapshot`].
#[derive(Debug, Default)]
pub(crate) struct ProxyMetrics {
	requests_received: AtomicU64,
	incompatible_messages: AtomicU64,
	timed_out_requests: AtomicU64,
	uploads_requested: AtomicU64,
	uploads_completed: AtomicU64,
	errors: AtomicU64,
}

impl ProxyMetrics {
	pub(crate) fn request_received(&self) {
		self.requests_received.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn incompatible_message(&self) {
		self.incompatible_messages.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn request_timeout(&self) {
		self.timed_out_requests.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn upload_requested(&self) {
		self.uploads_requested.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn upload_completed(&self) {
		self.uploads_completed.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn error(&self) {
		self.errors.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			requests_received: self.requests_received.load(Ordering::Relaxed),
			incompatible_messages: self.incompatible_messages.load(Ordering::Relaxed),
			timed_out_requests: self.timed_out_requests.load(Ordering::Relaxed),
			uploads_requested: self.uploads_requested.load(Ordering::Relaxed),
			uploads_completed: self.uploads_completed.load(Ordering::Relaxed),
			errors: self.errors.load(Ordering::Relaxed),
		}
	}
}

/// Point-in-time view of the proxy counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
	/// Messages observed on the listening destination.
	pub requests_received: u64,
	/// Messages dropped for unknown version, serializer, or malformed headers.
	pub incompatible_messages: u64,
	/// Messages whose deadline had already passed.
	pub timed_out_requests: u64,
	/// Fragmented uploads announced.
	pub uploads_requested: u64,
	/// Fragmented uploads fully reassembled.
	pub uploads_completed: u64,
	/// Handler, broker, and protocol-violation failures.
	pub errors: u64,
}
