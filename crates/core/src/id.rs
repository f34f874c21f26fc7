use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique connection identifier. Two connections never compare equal even if
/// some caller-visible label (e.g. a peer address string) happens to collide; identity
/// is the monotonic counter value, not anything derived from the socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl ConnectionId {
	pub fn value(&self) -> u64 {
		self.0
	}
}

#[derive(Debug, Default)]
pub struct ConnectionIdGenerator {
	next: AtomicU64,
}

impl ConnectionIdGenerator {
	pub fn new() -> Self {
		Self {
			next: AtomicU64::new(1),
		}
	}

	pub fn next(&self) -> ConnectionId {
		ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
	}
}

/// Monotonic per-`Server` handler sequence number, handed to every dispatched request
/// regardless of whether it goes through the HTTP-form or CONNECT path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl HandlerId {
	pub fn value(&self) -> u64 {
		self.0
	}
}

#[derive(Debug, Default)]
pub struct HandlerIdGenerator {
	next: AtomicU64,
}

impl HandlerIdGenerator {
	pub fn new() -> Self {
		Self {
			next: AtomicU64::new(1),
		}
	}

	pub fn next(&self) -> HandlerId {
		HandlerId(self.next.fetch_add(1, Ordering::Relaxed))
	}
}
