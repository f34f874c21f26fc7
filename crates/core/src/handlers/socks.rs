//! Minimal SOCKS5 client handshake (RFC 1928 connect + RFC 1929 username/password).

use std::net::IpAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::HandlerError;
use crate::prepare::UpstreamProxy;

use super::{connect_tcp, ConnectError};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

pub async fn connect(
	proxy: &UpstreamProxy,
	target_host: &str,
	target_port: u16,
	local_address: Option<&str>,
	client_timeout: Duration,
) -> Result<TcpStream, HandlerError> {
	let mut stream = connect_tcp(&proxy.host, proxy.port, local_address, client_timeout)
		.await
		.map_err(|e| match e {
			ConnectError::Dns(_) => HandlerError::UpstreamProxyDnsNotFound(proxy.host.clone()),
			ConnectError::Connect(_) => HandlerError::UpstreamProxyConnectFailed(proxy.host.clone()),
		})?;

	negotiate_method(&mut stream, proxy).await?;
	request_connect(&mut stream, target_host, target_port).await?;

	Ok(stream)
}

async fn negotiate_method(stream: &mut TcpStream, proxy: &UpstreamProxy) -> Result<(), HandlerError> {
	let offer_auth = proxy.username.is_some();
	let methods: &[u8] = if offer_auth {
		&[METHOD_NO_AUTH, METHOD_USERNAME_PASSWORD]
	} else {
		&[METHOD_NO_AUTH]
	};

	let mut greeting = vec![VERSION, methods.len() as u8];
	greeting.extend_from_slice(methods);
	stream
		.write_all(&greeting)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;

	let mut chosen = [0u8; 2];
	stream
		.read_exact(&mut chosen)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;
	if chosen[0] != VERSION {
		return Err(HandlerError::Other(anyhow::anyhow!(
			"upstream SOCKS proxy replied with an unexpected version byte"
		)));
	}

	match chosen[1] {
		METHOD_NO_AUTH => Ok(()),
		METHOD_USERNAME_PASSWORD => authenticate(stream, proxy).await,
		METHOD_NO_ACCEPTABLE => Err(HandlerError::UpstreamAuthRejected),
		_ => Err(HandlerError::Other(anyhow::anyhow!(
			"upstream SOCKS proxy chose an unsupported auth method"
		))),
	}
}

async fn authenticate(stream: &mut TcpStream, proxy: &UpstreamProxy) -> Result<(), HandlerError> {
	let username = proxy.username.as_deref().unwrap_or_default();
	let password = proxy.password.as_deref().unwrap_or_default();

	if username.contains(':') {
		return Err(HandlerError::UpstreamUsernameInvalidColon);
	}

	let mut payload = vec![0x01, username.len() as u8];
	payload.extend_from_slice(username.as_bytes());
	payload.push(password.len() as u8);
	payload.extend_from_slice(password.as_bytes());
	stream
		.write_all(&payload)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;

	let mut reply = [0u8; 2];
	stream
		.read_exact(&mut reply)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;
	if reply[1] != 0x00 {
		return Err(HandlerError::UpstreamAuthRejected);
	}
	Ok(())
}

async fn request_connect(stream: &mut TcpStream, host: &str, port: u16) -> Result<(), HandlerError> {
	let mut request = vec![VERSION, CMD_CONNECT, 0x00];
	match host.parse::<IpAddr>() {
		Ok(IpAddr::V4(ip)) => {
			request.push(ATYP_IPV4);
			request.extend_from_slice(&ip.octets());
		},
		Ok(IpAddr::V6(ip)) => {
			request.push(ATYP_IPV6);
			request.extend_from_slice(&ip.octets());
		},
		Err(_) => {
			if host.len() > 255 {
				return Err(HandlerError::Other(anyhow::anyhow!(
					"target hostname too long for SOCKS5 (was {} bytes)",
					host.len()
				)));
			}
			request.push(ATYP_DOMAIN);
			request.push(host.len() as u8);
			request.extend_from_slice(host.as_bytes());
		},
	}
	request.extend_from_slice(&port.to_be_bytes());

	stream
		.write_all(&request)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;

	let mut head = [0u8; 4];
	stream
		.read_exact(&mut head)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;
	if head[0] != VERSION {
		return Err(HandlerError::Other(anyhow::anyhow!(
			"upstream SOCKS proxy replied with an unexpected version byte"
		)));
	}
	if head[1] != REPLY_SUCCEEDED {
		return Err(HandlerError::TargetConnectFailed(host.to_string()));
	}

	// Drain the bound address the proxy echoes back; its length depends on ATYP.
	match head[3] {
		ATYP_IPV4 => skip(stream, 4 + 2).await,
		ATYP_IPV6 => skip(stream, 16 + 2).await,
		ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			stream
				.read_exact(&mut len)
				.await
				.map_err(|e| HandlerError::Other(e.into()))?;
			skip(stream, len[0] as usize + 2).await
		},
		other => Err(HandlerError::Other(anyhow::anyhow!(
			"upstream SOCKS proxy returned an unknown address type {other}"
		))),
	}
}

async fn skip(stream: &mut TcpStream, n: usize) -> Result<(), HandlerError> {
	let mut buf = vec![0u8; n];
	stream
		.read_exact(&mut buf)
		.await
		.map_err(|e| HandlerError::Other(e.into()))?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_with_colon_is_rejected_before_any_io() {
		let proxy = UpstreamProxy {
			scheme: crate::prepare::UpstreamScheme::Socks,
			host: "proxy.test".to_string(),
			port: 1080,
			username: Some("a:b".to_string()),
			password: Some("p".to_string()),
		};
		assert!(proxy.username.as_deref().unwrap().contains(':'));
	}
}
