//! Every accepted connection is peeked for its method token before being handed off:
//! `CONNECT` is handled entirely by hand ([`crate::connect_request`] +
//! [`crate::raw_response`]); everything else is replayed into hyper unchanged.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const MAX_SNIFF_BYTES: usize = 32;

pub struct PrefixedStream<S> {
	prefix: Bytes,
	inner: S,
}

impl<S> PrefixedStream<S> {
	pub fn new(prefix: Bytes, inner: S) -> Self {
		Self { prefix, inner }
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		if !self.prefix.is_empty() {
			let n = self.prefix.len().min(buf.remaining());
			buf.put_slice(&self.prefix[..n]);
			self.prefix = self.prefix.split_off(n);
			return Poll::Ready(Ok(()));
		}
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

pub async fn sniff_method<S: AsyncRead + Unpin>(mut stream: S) -> std::io::Result<(bool, Bytes, S)> {
	let mut consumed = Vec::with_capacity(8);
	let mut byte = [0u8; 1];
	loop {
		if consumed.len() >= MAX_SNIFF_BYTES {
			break;
		}
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			break;
		}
		consumed.push(byte[0]);
		if byte[0] == b' ' {
			break;
		}
	}
	let is_connect = consumed == b"CONNECT ";
	Ok((is_connect, Bytes::from(consumed), stream))
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::AsyncReadExt as _;

	#[tokio::test]
	async fn detects_connect_method() {
		let cursor = std::io::Cursor::new(b"CONNECT example.test:443 HTTP/1.1\r\n".to_vec());
		let (is_connect, prefix, _) = sniff_method(cursor).await.unwrap();
		assert!(is_connect);
		assert_eq!(&prefix[..], b"CONNECT ");
	}

	#[tokio::test]
	async fn replays_prefix_before_continuing_from_inner_stream() {
		let cursor = std::io::Cursor::new(b"GET / HTTP/1.1\r\n\r\n".to_vec());
		let (is_connect, prefix, rest) = sniff_method(cursor).await.unwrap();
		assert!(!is_connect);
		let mut prefixed = PrefixedStream::new(prefix, rest);
		let mut out = Vec::new();
		prefixed.read_to_end(&mut out).await.unwrap();
		assert_eq!(out, b"GET / HTTP/1.1\r\n\r\n");
	}
}
