//! Forwards the request verbatim (absolute-form URI intact) to the upstream HTTP proxy.

use std::time::Duration;

use base64::Engine;
use http::{HeaderValue, Request, Response};

use crate::body::ProxyBody;
use crate::byte_counter::{ByteCounter, CountedStream};
use crate::error::HandlerError;
use crate::prepare::{HandlerOptions, UpstreamProxy};

use super::{connect_tcp, forwardable_headers, send_via_http1, ConnectError};

pub async fn forward(
	options: &HandlerOptions,
	req: Request<ProxyBody>,
	client_timeout: Duration,
) -> Result<(Response<ProxyBody>, ByteCounter), HandlerError> {
	let upstream = options
		.upstream_proxy
		.as_ref()
		.expect("forward handler requires an upstream_proxy");

	let stream = connect_tcp(&upstream.host, upstream.port, options.local_address.as_deref(), client_timeout)
		.await
		.map_err(|e| match e {
			ConnectError::Dns(_) => HandlerError::UpstreamProxyDnsNotFound(upstream.host.clone()),
			ConnectError::Connect(_) => HandlerError::UpstreamProxyConnectFailed(upstream.host.clone()),
		})?;
	let counter = ByteCounter::new();
	let stream = CountedStream::new(stream, counter.clone());

	let (parts, body) = req.into_parts();
	let mut headers = forwardable_headers(&parts.headers);
	if let Some(value) = upstream_authorization(upstream)? {
		headers.insert(http::header::PROXY_AUTHORIZATION, value);
	}

	let mut out = Request::builder().method(parts.method).uri(parts.uri);
	*out.headers_mut().expect("builder has no error yet") = headers;
	let out = out.body(body).map_err(|e| HandlerError::Other(e.into()))?;

	let response = send_via_http1(stream, out).await?;
	Ok((response, counter))
}

fn upstream_authorization(upstream: &UpstreamProxy) -> Result<Option<HeaderValue>, HandlerError> {
	let Some(username) = upstream.username.as_deref() else {
		return Ok(None);
	};
	if username.contains(':') {
		return Err(HandlerError::UpstreamUsernameInvalidColon);
	}
	let password = upstream.password.as_deref().unwrap_or_default();
	let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
	let value = HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|e| HandlerError::Other(e.into()))?;
	Ok(Some(value))
}
