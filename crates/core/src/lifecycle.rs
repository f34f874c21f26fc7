//! Start/stop/close semantics (spec.md §6 Lifecycle API / §9 accept-loop note). The
//! accept loop follows the teacher's `Gateway::run_bind` shape — a loop over
//! `listener.accept()` racing a cancellation signal, one task per connection — but uses
//! [`tokio_util::sync::CancellationToken`] in place of the teacher's hand-rolled
//! `agent_core::drain` module, and a [`JoinSet`] the loop drains on the way out so
//! `close` only returns once every connection has actually torn down.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::byte_counter::{ByteCounter, CountedStream};
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::events::EventBus;
use crate::id::ConnectionId;
use crate::registry::{ConnectionRegistry, ConnectionStats};
use crate::sniff::{self, PrefixedStream};

/// Entry point: binds a listener per `config` and starts accepting. Returns a
/// [`ServerHandle`] the embedder keeps for the lifetime of the server.
pub struct Server;

impl Server {
	pub async fn listen(config: ServerConfig) -> std::io::Result<Arc<ServerHandle>> {
		let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
		let listener = TcpListener::bind(addr).await?;
		let actual_port = listener.local_addr()?.port();

		let events = EventBus::new();
		let registry = ConnectionRegistry::new(events.clone());
		let dispatcher = Dispatcher::new(&config, registry.clone(), events.clone());
		let cancel = CancellationToken::new();

		let accept_task = tokio::spawn(run_accept_loop(listener, dispatcher.clone(), registry.clone(), cancel.clone()));

		Ok(Arc::new(ServerHandle {
			port: actual_port,
			registry,
			events,
			dispatcher,
			cancel,
			accept_task: AsyncMutex::new(Some(accept_task)),
		}))
	}
}

/// A running server: the live connection registry, the event bus embedders subscribe
/// to, and the handle needed to stop accepting and tear everything down. Reflects the
/// OS-assigned port back via [`ServerHandle::port`] when `ServerConfig::port` was 0
/// (spec.md §6).
pub struct ServerHandle {
	port: u16,
	registry: ConnectionRegistry,
	events: EventBus,
	dispatcher: Dispatcher,
	cancel: CancellationToken,
	accept_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
	pub fn port(&self) -> u16 {
		self.port
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	pub fn connection_ids(&self) -> Vec<ConnectionId> {
		self.registry.ids()
	}

	pub fn connection_stats(&self, id: ConnectionId) -> Option<ConnectionStats> {
		self.registry.stats_for(id)
	}

	/// Force-destroys every live connection without stopping the listener. The
	/// Lifecycle API's standalone `closeConnections()` (spec.md §4.1/§6).
	pub fn close_connections(&self) {
		self.registry.destroy_all();
	}

	pub fn http_request_count(&self) -> u64 {
		self.dispatcher.http_request_count()
	}

	pub fn connect_request_count(&self) -> u64 {
		self.dispatcher.connect_request_count()
	}

	/// Stops accepting new connections; if `close_connections` is true, force-destroys
	/// every live socket first. Either way, does not return until every connection task
	/// has actually finished — `getConnectionIds()` is guaranteed empty once this
	/// resolves (spec.md invariant 5 / scenario S6). Idempotent: a second call is a
	/// no-op once the first has taken the accept task.
	pub async fn close(&self, close_connections: bool) {
		self.cancel.cancel();
		if close_connections {
			self.registry.destroy_all();
		}
		let task = self.accept_task.lock().await.take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

async fn run_accept_loop(listener: TcpListener, dispatcher: Dispatcher, registry: ConnectionRegistry, cancel: CancellationToken) {
	let mut connections: JoinSet<()> = JoinSet::new();
	loop {
		tokio::select! {
			_ = cancel.cancelled() => break,
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						spawn_connection(&mut connections, stream, peer, dispatcher.clone(), registry.clone());
					},
					Err(e) => {
						tracing::warn!(target: "proxychain::lifecycle", error = %e, "accept failed");
					},
				}
			}
		}
	}

	// Stop accepting; drain whatever is still in flight so `close` only resolves once
	// every connection has actually torn down (forced or natural).
	while connections.join_next().await.is_some() {}
}

/// Spawns the task that owns one accepted socket for its whole lifetime, registering it
/// with the [`ConnectionRegistry`] before any I/O runs. The registry needs the task's
/// `AbortHandle` to force it down on `destroyAll`, but the handle only exists once the
/// task is spawned — so the task's first act is to wait on a oneshot for its own handle,
/// sent right after `JoinSet::spawn` returns it.
fn spawn_connection(
	connections: &mut JoinSet<()>,
	stream: TcpStream,
	peer: SocketAddr,
	dispatcher: Dispatcher,
	registry: ConnectionRegistry,
) {
	let (abort_tx, abort_rx) = oneshot::channel();
	let handle = connections.spawn(async move {
		let Ok(abort) = abort_rx.await else { return };
		let (connection_id, src_counter, _guard) = registry.register(abort);
		let span = tracing::info_span!("connection", id = %connection_id, peer = %peer);
		handle_connection(stream, connection_id, src_counter, dispatcher).instrument(span).await;
	});
	let _ = abort_tx.send(handle.abort_handle());
}

/// Peeks the method to decide `CONNECT` (handled entirely by hand, see
/// [`crate::connect_request`]) vs everything else (replayed into hyper's normal
/// request/response machinery), per [`crate::sniff`]'s module doc.
async fn handle_connection(stream: TcpStream, connection_id: ConnectionId, src_counter: ByteCounter, dispatcher: Dispatcher) {
	let peer = stream.peer_addr().ok();
	let mut counted = CountedStream::new(stream, src_counter);
	if let Some(peer) = peer {
		counted = counted.with_peer(peer);
	}

	let (is_connect, prefix, counted) = match sniff::sniff_method(counted).await {
		Ok(v) => v,
		Err(e) => {
			tracing::debug!(target: "proxychain::lifecycle", error = %e, "failed reading request method");
			return;
		},
	};

	if is_connect {
		let mut counted = counted;
		dispatcher.on_connect(connection_id, &mut counted).await;
		return;
	}

	let io = TokioIo::new(PrefixedStream::new(prefix, counted));
	let service = service_fn(move |req| {
		let dispatcher = dispatcher.clone();
		async move { Ok::<_, std::convert::Infallible>(dispatcher.on_request(connection_id, req).await) }
	});

	if let Err(e) = http1::Builder::new().serve_connection(io, service).with_upgrades().await {
		tracing::debug!(target: "proxychain::lifecycle", error = %e, "http/1 connection ended with an error");
	}
}
