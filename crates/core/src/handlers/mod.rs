//! The transport strategies a request can be routed to.

pub mod chain;
pub mod custom_response;
pub mod direct;
pub mod forward;
pub mod forward_socks;
pub mod socks;
pub mod tunnel_socks;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use http::{HeaderMap, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::body::{box_body, ProxyBody};
use crate::error::HandlerError;
use crate::prepare::{HandlerOptions, UpstreamScheme};

pub trait AsyncDuplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncDuplex for T {}

pub(crate) fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
	let mut out = HeaderMap::with_capacity(headers.len());
	for (name, value) in headers.iter() {
		if name.as_str().eq_ignore_ascii_case("proxy-authorization")
			|| name.as_str().eq_ignore_ascii_case("proxy-connection")
		{
			continue;
		}
		out.append(name.clone(), value.clone());
	}
	out
}

/// DNS failure vs. everything else dialing a host can fail with; the two map to
/// different client-visible statuses.
pub(crate) enum ConnectError {
	Dns(std::io::Error),
	Connect(std::io::Error),
}

pub(crate) async fn connect_tcp(
	host: &str,
	port: u16,
	local_address: Option<&str>,
	timeout: Duration,
) -> Result<TcpStream, ConnectError> {
	let mut addrs = lookup_host((host, port)).await.map_err(ConnectError::Dns)?;
	let addr = addrs.next().ok_or_else(|| {
		ConnectError::Dns(std::io::Error::new(
			std::io::ErrorKind::NotFound,
			"host resolved to no addresses",
		))
	})?;

	let socket = match addr {
		SocketAddr::V4(_) => TcpSocket::new_v4(),
		SocketAddr::V6(_) => TcpSocket::new_v6(),
	}
	.map_err(ConnectError::Connect)?;
	if let Some(local) = local_address {
		let ip: IpAddr = local
			.parse()
			.map_err(|_| ConnectError::Connect(std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid local_address")))?;
		socket.bind(SocketAddr::new(ip, 0)).map_err(ConnectError::Connect)?;
	}

	match tokio::time::timeout(timeout, socket.connect(addr)).await {
		Ok(result) => result.map_err(ConnectError::Connect),
		Err(_) => Err(ConnectError::Connect(std::io::Error::new(
			std::io::ErrorKind::TimedOut,
			"connect timed out",
		))),
	}
}

pub(crate) async fn send_via_http1<S>(
	io: S,
	req: Request<ProxyBody>,
) -> Result<Response<ProxyBody>, HandlerError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	let (mut sender, connection) = hyper::client::conn::http1::handshake(hyper_util::rt::TokioIo::new(io))
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;

	tokio::spawn(async move {
		if let Err(err) = connection.await {
			tracing::debug!(target: "proxychain::handlers", error = %err, "upstream http/1 connection ended");
		}
	});

	let response = sender
		.send_request(req)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;
	let (parts, body) = response.into_parts();
	Ok(Response::from_parts(parts, box_body(body)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
	Direct,
	Chain,
	TunnelSocks,
	Forward,
	ForwardSocks,
	CustomResponse,
}

pub fn select(options: &HandlerOptions) -> Strategy {
	if options.custom_response_function.is_some() {
		return Strategy::CustomResponse;
	}
	// `onRequest` (HTTP form): socks upstream -> forwardSocks, everything else
	// (no upstream or http upstream) -> forward.
	// `onConnect`: no upstream -> direct, http upstream -> chain, socks -> tunnelSocks.
	match (options.is_http, &options.upstream_proxy) {
		(true, Some(p)) if p.scheme == UpstreamScheme::Socks => Strategy::ForwardSocks,
		(true, _) => Strategy::Forward,
		(false, None) => Strategy::Direct,
		(false, Some(p)) if p.scheme == UpstreamScheme::Http => Strategy::Chain,
		(false, Some(p)) if p.scheme == UpstreamScheme::Socks => Strategy::TunnelSocks,
		(false, Some(_)) => unreachable!("UpstreamScheme is exhaustively Http | Socks"),
	}
}
