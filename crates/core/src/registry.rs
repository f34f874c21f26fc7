//! Connection bookkeeping: per-socket byte counters and the `connectionClosed`
//! notification fired when a connection's owning task ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::AbortHandle;

use crate::byte_counter::ByteCounter;
use crate::events::{ConnectionClosedEvent, EventBus};
use crate::id::{ConnectionId, ConnectionIdGenerator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
	pub src_tx_bytes: u64,
	pub src_rx_bytes: u64,
	pub trg_tx_bytes: u64,
	pub trg_rx_bytes: u64,
}

struct ConnectionEntry {
	src_counter: ByteCounter,
	trg_counter: Mutex<Option<ByteCounter>>,
	abort: AbortHandle,
	closed: AtomicBool,
}

impl ConnectionEntry {
	fn stats(&self) -> ConnectionStats {
		let trg = self.trg_counter.lock().expect("trg_counter poisoned");
		ConnectionStats {
			src_tx_bytes: self.src_counter.tx_bytes(),
			src_rx_bytes: self.src_counter.rx_bytes(),
			trg_tx_bytes: trg.as_ref().map(|c| c.tx_bytes()).unwrap_or(0),
			trg_rx_bytes: trg.as_ref().map(|c| c.rx_bytes()).unwrap_or(0),
		}
	}
}

#[derive(Default)]
struct Inner {
	live: Mutex<HashMap<ConnectionId, Arc<ConnectionEntry>>>,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
	inner: Arc<Inner>,
	ids: Arc<ConnectionIdGenerator>,
	events: EventBus,
}

impl ConnectionRegistry {
	pub fn new(events: EventBus) -> Self {
		Self {
			inner: Arc::new(Inner::default()),
			ids: Arc::new(ConnectionIdGenerator::new()),
			events,
		}
	}

	pub fn register(&self, abort: AbortHandle) -> (ConnectionId, ByteCounter, ConnectionGuard) {
		let id = self.ids.next();
		let src_counter = ByteCounter::new();
		let entry = Arc::new(ConnectionEntry {
			src_counter: src_counter.clone(),
			trg_counter: Mutex::new(None),
			abort,
			closed: AtomicBool::new(false),
		});
		self
			.inner
			.live
			.lock()
			.expect("registry poisoned")
			.insert(id, entry.clone());
		let guard = ConnectionGuard {
			id,
			entry,
			registry: self.clone(),
		};
		(id, src_counter, guard)
	}

	pub fn attach_target_counter(&self, connection_id: ConnectionId, counter: ByteCounter) {
		if let Some(entry) = self
			.inner
			.live
			.lock()
			.expect("registry poisoned")
			.get(&connection_id)
		{
			*entry.trg_counter.lock().expect("trg_counter poisoned") = Some(counter);
		}
	}

	pub fn stats_for(&self, connection_id: ConnectionId) -> Option<ConnectionStats> {
		self
			.inner
			.live
			.lock()
			.expect("registry poisoned")
			.get(&connection_id)
			.map(|e| e.stats())
	}

	pub fn ids(&self) -> Vec<ConnectionId> {
		self
			.inner
			.live
			.lock()
			.expect("registry poisoned")
			.keys()
			.copied()
			.collect()
	}

	pub fn abort(&self, id: ConnectionId) {
		if let Some(entry) = self.inner.live.lock().expect("registry poisoned").get(&id) {
			entry.abort.abort();
		}
	}

	// Snapshot before aborting: concurrent close() calls from aborted tasks dropping
	// their guards must not mutate the map we're iterating.
	pub fn destroy_all(&self) {
		let snapshot: Vec<Arc<ConnectionEntry>> = self
			.inner
			.live
			.lock()
			.expect("registry poisoned")
			.values()
			.cloned()
			.collect();
		for entry in snapshot {
			entry.abort.abort();
		}
	}

	fn close(&self, id: ConnectionId, entry: &Arc<ConnectionEntry>) {
		if entry.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let stats = Some(entry.stats());
		self.events.emit_connection_closed(ConnectionClosedEvent {
			connection_id: id,
			stats,
		});
		self.inner.live.lock().expect("registry poisoned").remove(&id);
	}
}

pub struct ConnectionGuard {
	id: ConnectionId,
	entry: Arc<ConnectionEntry>,
	registry: ConnectionRegistry,
}

impl ConnectionGuard {
	pub fn id(&self) -> ConnectionId {
		self.id
	}
}

impl Drop for ConnectionGuard {
	fn drop(&mut self) {
		self.registry.close(self.id, &self.entry);
	}
}
