//! Per-call context table and the periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_proto::CallId;
use tokio::time::Instant;

use super::response::ResponseContext;
use super::upload::UploadContext;

/// Minimum interval between opportunistic sweeps of closed entries.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// The currently-active server context for one call.
pub(crate) enum ServerContext<M> {
	/// Streaming-response phase.
	Response(Arc<ResponseContext<M>>),
	/// Upload-in-progress phase.
	Upload(Arc<UploadContext<M>>),
}

impl<M> Clone for ServerContext<M> {
	fn clone(&self) -> Self {
		match self {
			Self::Response(ctx) => Self::Response(ctx.clone()),
			Self::Upload(ctx) => Self::Upload(ctx.clone()),
		}
	}
}

impl<M: 'static> ServerContext<M> {
	fn is_closed(&self) -> bool {
		match self {
			Self::Response(ctx) => ctx.is_closed(),
			Self::Upload(ctx) => ctx.is_closed(),
		}
	}

	fn force_close(&self) {
		match self {
			Self::Response(ctx) => ctx.force_close(),
			Self::Upload(ctx) => ctx.force_close(),
		}
	}
}

/// A plain signal arrived while an upload holds the correlation id.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct UploadInProgress;

/// Mapping from correlation identifier to the active server context.
///
/// At most one context per correlation id at any time; promotion from upload
/// to response replaces the entry in a single table operation. Entries are
/// removed by the sweep once their context reports closed, or wholesale on
/// proxy teardown.
pub(crate) struct CallTable<M> {
	entries: Mutex<HashMap<CallId, ServerContext<M>>>,
	/// Timestamp guard serializing the sweep with itself. Monotonic on
	/// purpose: wall-clock regression must not defer cleanup.
	last_sweep: Mutex<Instant>,
}

impl<M: 'static> CallTable<M> {
	pub(crate) fn new() -> Self {
		Self {
			entries: Mutex::new(HashMap::new()),
			last_sweep: Mutex::new(Instant::now()),
		}
	}

	pub(crate) fn get(&self, call_id: &CallId) -> Option<ServerContext<M>> {
		self.entries.lock().unwrap().get(call_id).cloned()
	}

	/// Resolve the context for an inbound signal.
	///
	/// Reuses an existing response context, creates one when the call is new,
	/// and rejects the message when an upload is still in progress.
	pub(crate) fn signal_context(
		&self,
		call_id: &CallId,
		create: impl FnOnce() -> Arc<ResponseContext<M>>,
	) -> Result<Arc<ResponseContext<M>>, UploadInProgress> {
		let mut entries = self.entries.lock().unwrap();
		match entries.get(call_id) {
			Some(ServerContext::Response(ctx)) => Ok(ctx.clone()),
			Some(ServerContext::Upload(_)) => Err(UploadInProgress),
			None => {
				let ctx = create();
				entries.insert(call_id.clone(), ServerContext::Response(ctx.clone()));
				Ok(ctx)
			}
		}
	}

	/// Insert a context iff no entry exists for the call id.
	///
	/// Returns false when another context won the race.
	pub(crate) fn try_insert(&self, call_id: &CallId, context: ServerContext<M>) -> bool {
		let mut entries = self.entries.lock().unwrap();
		if entries.contains_key(call_id) {
			return false;
		}
		entries.insert(call_id.clone(), context);
		true
	}

	/// Replace whatever holds the call id with a response context.
	///
	/// This is the upload-to-response promotion; the single map insert keeps
	/// the table populated for the call at every instant.
	pub(crate) fn promote(&self, call_id: &CallId, context: Arc<ResponseContext<M>>) {
		self.entries
			.lock()
			.unwrap()
			.insert(call_id.clone(), ServerContext::Response(context));
	}

	/// Remove closed entries, at most once per [`SWEEP_INTERVAL`].
	///
	/// Returns true if a sweep ran. A stale closed entry racing a promotion is
	/// either removed before the promotion's insert (benign) or already
	/// replaced by the fresh context, which the closed-check skips.
	pub(crate) fn maybe_sweep(&self) -> bool {
		let mut last_sweep = self.last_sweep.lock().unwrap();
		if last_sweep.elapsed() < SWEEP_INTERVAL {
			return false;
		}
		*last_sweep = Instant::now();

		let mut entries = self.entries.lock().unwrap();
		entries.retain(|_, ctx| {
			if ctx.is_closed() {
				// Releases the fragment listener of an expired upload.
				ctx.force_close();
				false
			} else {
				true
			}
		});
		true
	}

	/// Close upload contexts and their fragment listeners.
	///
	/// Stop path only: once the permit pool is closed an upload can never
	/// complete, so there is nothing to wait for.
	pub(crate) fn close_uploads(&self) {
		let entries = self.entries.lock().unwrap();
		for ctx in entries.values() {
			if let ServerContext::Upload(ctx) = ctx {
				ctx.force_close();
			}
		}
	}

	/// Close every context and clear the table. Teardown only.
	pub(crate) fn close_all(&self) {
		let mut entries = self.entries.lock().unwrap();
		for ctx in entries.values() {
			ctx.force_close();
		}
		entries.clear();
	}

	#[cfg(test)]
	pub(crate) fn len(&self) -> usize {
		self.entries.lock().unwrap().len()
	}
}
