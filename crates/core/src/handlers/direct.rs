//! No upstream proxy configured: dial the target directly.

use std::time::Duration;

use http::{Request, Response};

use crate::body::ProxyBody;
use crate::byte_counter::{ByteCounter, CountedStream};
use crate::error::HandlerError;
use crate::prepare::{HandlerOptions, TargetParsed};

use super::{connect_tcp, forwardable_headers, send_via_http1, AsyncDuplex, ConnectError};

pub async fn dial(
	target: &TargetParsed,
	local_address: Option<&str>,
	client_timeout: Duration,
) -> Result<(Box<dyn AsyncDuplex>, ByteCounter), HandlerError> {
	let tcp = connect_tcp(&target.host, target.port, local_address, client_timeout)
		.await
		.map_err(|e| match e {
			ConnectError::Dns(_) => HandlerError::TargetDnsNotFound(target.host.clone()),
			ConnectError::Connect(_) => HandlerError::TargetConnectFailed(target.host.clone()),
		})?;

	let counter = ByteCounter::new();
	let counted = CountedStream::new(tcp, counter.clone());
	Ok((Box::new(counted), counter))
}

pub async fn forward(
	options: &HandlerOptions,
	req: Request<ProxyBody>,
	client_timeout: Duration,
) -> Result<(Response<ProxyBody>, ByteCounter), HandlerError> {
	let (parts, body) = req.into_parts();
	let (stream, counter) = dial(&options.target, options.local_address.as_deref(), client_timeout).await?;

	let path = options.target.path_and_query.clone().unwrap_or_else(|| "/".to_string());
	let mut out = Request::builder().method(parts.method).uri(path);
	*out.headers_mut().expect("builder has no error yet") = forwardable_headers(&parts.headers);
	let out = out.body(body).map_err(|e| HandlerError::Other(e.into()))?;

	let response = send_via_http1(stream, out).await?;
	Ok((response, counter))
}
