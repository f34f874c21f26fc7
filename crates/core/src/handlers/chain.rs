//! Asks the upstream HTTP proxy to CONNECT to the real target on our behalf.

use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::byte_counter::{ByteCounter, CountedStream};
use crate::error::HandlerError;
use crate::prepare::{HandlerOptions, UpstreamProxy};

use super::{connect_tcp, AsyncDuplex, ConnectError};

const MAX_RESPONSE_HEAD: usize = 8 * 1024;

pub async fn dial(
	options: &HandlerOptions,
	client_timeout: Duration,
) -> Result<(Box<dyn AsyncDuplex>, ByteCounter), HandlerError> {
	let upstream = options
		.upstream_proxy
		.as_ref()
		.expect("chain handler requires an upstream_proxy");

	let mut stream = connect_tcp(&upstream.host, upstream.port, options.local_address.as_deref(), client_timeout)
		.await
		.map_err(|e| match e {
			ConnectError::Dns(_) => HandlerError::UpstreamProxyDnsNotFound(upstream.host.clone()),
			ConnectError::Connect(_) => HandlerError::UpstreamProxyConnectFailed(upstream.host.clone()),
		})?;

	let target = format!("{}:{}", options.target.host, options.target.port);
	let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
	if let Some(value) = upstream_authorization(upstream)? {
		request.push_str("Proxy-Authorization: ");
		request.push_str(&value);
		request.push_str("\r\n");
	}
	request.push_str("\r\n");

	stream
		.write_all(request.as_bytes())
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;

	let status = read_status_line(&mut stream).await?;
	if status == 407 {
		return Err(HandlerError::UpstreamAuthRejected);
	}
	if status != 200 {
		return Err(HandlerError::TargetConnectFailed(options.target.host.clone()));
	}

	let counter = ByteCounter::new();
	let counted = CountedStream::new(stream, counter.clone());
	Ok((Box::new(counted), counter))
}

fn upstream_authorization(upstream: &UpstreamProxy) -> Result<Option<String>, HandlerError> {
	let Some(username) = upstream.username.as_deref() else {
		return Ok(None);
	};
	if username.contains(':') {
		return Err(HandlerError::UpstreamUsernameInvalidColon);
	}
	let password = upstream.password.as_deref().unwrap_or_default();
	let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
	Ok(Some(format!("Basic {encoded}")))
}

async fn read_status_line(stream: &mut TcpStream) -> Result<u16, HandlerError> {
	let mut head = Vec::new();
	let mut byte = [0u8; 1];
	loop {
		if head.len() >= MAX_RESPONSE_HEAD {
			return Err(HandlerError::Other(anyhow::anyhow!(
				"upstream proxy's CONNECT response exceeded {MAX_RESPONSE_HEAD} bytes without completing"
			)));
		}
		let n = stream
			.read(&mut byte)
			.await
			.map_err(|e| HandlerError::Other(e.into()))?;
		if n == 0 {
			return Err(HandlerError::Other(anyhow::anyhow!(
				"upstream proxy closed the connection before completing its CONNECT response"
			)));
		}
		head.push(byte[0]);
		if head.ends_with(b"\r\n\r\n") {
			break;
		}
	}

	let text = String::from_utf8_lossy(&head);
	let status_line = text
		.lines()
		.next()
		.ok_or_else(|| HandlerError::Other(anyhow::anyhow!("upstream proxy sent an empty CONNECT response")))?;
	let status = status_line
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse::<u16>().ok())
		.ok_or_else(|| {
			HandlerError::Other(anyhow::anyhow!(
				"upstream proxy's CONNECT response had no parseable status code"
			))
		})?;
	Ok(status)
}
