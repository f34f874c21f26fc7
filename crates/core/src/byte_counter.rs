//! Byte-counting instrumentation for target-side sockets.
//!
//! Handlers wrap whatever outbound socket they open in a [`CountedStream`] at the point
//! of creation; the [`ByteCounter`] handle is cloned into the [`registry::ConnectionEntry`]
//! so `statsFor` can read it without touching the socket itself.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default, Clone)]
pub struct ByteCounter {
	counts: Arc<(AtomicU64, AtomicU64)>,
}

impl ByteCounter {
	pub fn new() -> Self {
		Self::default()
	}

	fn add_tx(&self, amt: usize) {
		self.counts.0.fetch_add(amt as u64, Ordering::Relaxed);
	}

	fn add_rx(&self, amt: usize) {
		self.counts.1.fetch_add(amt as u64, Ordering::Relaxed);
	}

	pub fn tx_bytes(&self) -> u64 {
		self.counts.0.load(Ordering::Relaxed)
	}

	pub fn rx_bytes(&self) -> u64 {
		self.counts.1.load(Ordering::Relaxed)
	}
}

/// Wraps any `AsyncRead + AsyncWrite` socket, recording bytes written (tx, from the
/// proxy's perspective: data sent to the target) and bytes read (rx: data received
/// from the target) through a shared [`ByteCounter`].
pub struct CountedStream<S> {
	inner: S,
	counter: ByteCounter,
	peer: Option<SocketAddr>,
}

impl<S> CountedStream<S> {
	pub fn new(inner: S, counter: ByteCounter) -> Self {
		Self {
			inner,
			counter,
			peer: None,
		}
	}

	pub fn with_peer(mut self, peer: SocketAddr) -> Self {
		self.peer = Some(peer);
		self
	}

	pub fn counter(&self) -> ByteCounter {
		self.counter.clone()
	}

	pub fn peer_addr(&self) -> Option<SocketAddr> {
		self.peer
	}

	pub fn into_inner(self) -> S {
		self.inner
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for CountedStream<S> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		let before = buf.filled().len();
		let res = Pin::new(&mut self.inner).poll_read(cx, buf);
		if res.is_ready() {
			let read = buf.filled().len() - before;
			if read > 0 {
				self.counter.add_rx(read);
			}
		}
		res
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CountedStream<S> {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		let res = Pin::new(&mut self.inner).poll_write(cx, buf);
		if let Poll::Ready(Ok(n)) = &res {
			self.counter.add_tx(*n);
		}
		res
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}
