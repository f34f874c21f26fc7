//! A SOCKS proxy has no concept of HTTP forwarding, so negotiate a raw tunnel to the
//! target and speak HTTP over it ourselves, as [`super::direct`] does for no upstream.

use std::time::Duration;

use http::{Request, Response};

use crate::body::ProxyBody;
use crate::byte_counter::{ByteCounter, CountedStream};
use crate::error::HandlerError;
use crate::prepare::HandlerOptions;

use super::{forwardable_headers, send_via_http1, socks};

pub async fn forward(
	options: &HandlerOptions,
	req: Request<ProxyBody>,
	client_timeout: Duration,
) -> Result<(Response<ProxyBody>, ByteCounter), HandlerError> {
	let upstream = options
		.upstream_proxy
		.as_ref()
		.expect("forward_socks handler requires an upstream_proxy");

	let stream = socks::connect(
		upstream,
		&options.target.host,
		options.target.port,
		options.local_address.as_deref(),
		client_timeout,
	)
	.await?;
	let counter = ByteCounter::new();
	let stream = CountedStream::new(stream, counter.clone());

	let (parts, body) = req.into_parts();
	let path = options.target.path_and_query.clone().unwrap_or_else(|| "/".to_string());
	let mut out = Request::builder().method(parts.method).uri(path);
	*out.headers_mut().expect("builder has no error yet") = forwardable_headers(&parts.headers);
	let out = out.body(body).map_err(|e| HandlerError::Other(e.into()))?;

	let response = send_via_http1(stream, out).await?;
	Ok((response, counter))
}
