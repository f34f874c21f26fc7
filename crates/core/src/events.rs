//! Observations the server surfaces to embedding code: `requestFailed` and
//! `connectionClosed`. The two events are independent (spec.md §9), so each gets its own
//! broadcast channel rather than a single enum stream — a subscriber interested only in
//! connection lifecycle never sees (and never backs up behind) request failures.

use tokio::sync::broadcast;

use crate::id::ConnectionId;
use crate::registry::ConnectionStats;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RequestFailedEvent {
	/// Human-readable error, already formatted (the underlying error type is not
	/// `Clone`, and subscribers only ever want the message plus enough context to
	/// correlate it with a request).
	pub error: String,
	pub method: Option<String>,
	pub uri: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionClosedEvent {
	pub connection_id: ConnectionId,
	pub stats: Option<ConnectionStats>,
}

/// Fan-out point for server-level observations. Cloning an `EventBus` shares the same
/// underlying channels (it is a thin handle), so `Server`, `ConnectionRegistry`, and
/// `Dispatcher` can each hold one without coordinating ownership.
#[derive(Clone)]
pub struct EventBus {
	request_failed: broadcast::Sender<RequestFailedEvent>,
	connection_closed: broadcast::Sender<ConnectionClosedEvent>,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl EventBus {
	pub fn new() -> Self {
		let (request_failed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		let (connection_closed, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
		Self {
			request_failed,
			connection_closed,
		}
	}

	pub fn subscribe_request_failed(&self) -> broadcast::Receiver<RequestFailedEvent> {
		self.request_failed.subscribe()
	}

	pub fn subscribe_connection_closed(&self) -> broadcast::Receiver<ConnectionClosedEvent> {
		self.connection_closed.subscribe()
	}

	/// Emits `requestFailed`. A send with no subscribers is not an error — the event is
	/// just discarded, exactly as it would be if the embedder never attached a listener.
	pub fn emit_request_failed(&self, event: RequestFailedEvent) {
		let _ = self.request_failed.send(event);
	}

	pub fn emit_connection_closed(&self, event: ConnectionClosedEvent) {
		let _ = self.connection_closed.send(event);
	}
}
