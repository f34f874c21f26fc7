//! Negotiates a SOCKS5 tunnel to the target through the upstream proxy.

use std::time::Duration;

use crate::byte_counter::{ByteCounter, CountedStream};
use crate::error::HandlerError;
use crate::prepare::HandlerOptions;

use super::socks;
use super::AsyncDuplex;

pub async fn dial(
	options: &HandlerOptions,
	client_timeout: Duration,
) -> Result<(Box<dyn AsyncDuplex>, ByteCounter), HandlerError> {
	let upstream = options
		.upstream_proxy
		.as_ref()
		.expect("tunnel_socks handler requires an upstream_proxy");

	let stream = socks::connect(
		upstream,
		&options.target.host,
		options.target.port,
		options.local_address.as_deref(),
		client_timeout,
	)
	.await?;

	let counter = ByteCounter::new();
	let counted = CountedStream::new(stream, counter.clone());
	Ok((Box::new(counted), counter))
}
