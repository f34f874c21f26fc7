//! Writes a complete HTTP response straight onto a socket, bypassing hyper entirely.
//! Used on the CONNECT error path, where no hyper response object exists.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::body::{full_body, ProxyBody};
use crate::id::ConnectionId;
use crate::registry::ConnectionRegistry;

fn reason_phrase(status: http::StatusCode) -> &'static str {
	match status.as_u16() {
		200 => "OK",
		400 => "Bad Request",
		401 => "Unauthorized",
		403 => "Forbidden",
		404 => "Not Found",
		407 => "Proxy Authentication Required",
		500 => "Internal Server Error",
		501 => "Not Implemented",
		502 => "Bad Gateway",
		503 => "Service Unavailable",
		504 => "Gateway Timeout",
		_ => "Error",
	}
}

fn rfc1123_date() -> String {
	chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn render(status: http::StatusCode, message: &str, auth_realm: &str, extra_headers: &[(String, String)]) -> Vec<u8> {
	let body = message.as_bytes();

	let mut headers: Vec<(String, String)> = vec![
		("Date".to_string(), rfc1123_date()),
		("Server".to_string(), auth_realm.to_string()),
		("Content-Type".to_string(), "text/plain; charset=utf-8".to_string()),
		("Content-Length".to_string(), body.len().to_string()),
		("Connection".to_string(), "close".to_string()),
	];

	for (name, value) in extra_headers {
		match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
			Some(slot) => slot.1 = value.clone(),
			None => headers.push((name.clone(), value.clone())),
		}
	}

	let mut out = format!(
		"HTTP/1.1 {} {}\r\n",
		status.as_u16(),
		reason_phrase(status)
	)
	.into_bytes();
	for (name, value) in &headers {
		out.extend_from_slice(name.as_bytes());
		out.extend_from_slice(b": ");
		out.extend_from_slice(value.as_bytes());
		out.extend_from_slice(b"\r\n");
	}
	out.extend_from_slice(b"\r\n");
	out.extend_from_slice(body);
	out
}

pub fn hyper_response(status: http::StatusCode, message: &str, auth_realm: &str, extra_headers: &[(String, String)]) -> http::Response<ProxyBody> {
	let mut headers: Vec<(String, String)> = vec![
		("Date".to_string(), rfc1123_date()),
		("Server".to_string(), auth_realm.to_string()),
		("Content-Type".to_string(), "text/plain; charset=utf-8".to_string()),
		("Connection".to_string(), "close".to_string()),
	];
	for (name, value) in extra_headers {
		match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
			Some(slot) => slot.1 = value.clone(),
			None => headers.push((name.clone(), value.clone())),
		}
	}

	let mut builder = http::Response::builder().status(status);
	for (name, value) in &headers {
		builder = builder.header(name.as_str(), value.as_str());
	}
	builder
		.body(full_body(message.to_string()))
		.expect("status and header values are always well-formed here")
}

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[allow(clippy::too_many_arguments)]
pub async fn write_and_schedule_destroy<S>(
	stream: &mut S,
	status: http::StatusCode,
	message: &str,
	auth_realm: &str,
	extra_headers: &[(String, String)],
	registry: &ConnectionRegistry,
	connection_id: ConnectionId,
	shutdown_grace: Duration,
) -> std::io::Result<()>
where
	S: AsyncWrite + Unpin,
{
	let bytes = render(status, message, auth_realm, extra_headers);
	stream.write_all(&bytes).await?;
	let _ = stream.shutdown().await;
	schedule_forced_close(registry, connection_id, shutdown_grace);
	Ok(())
}

pub fn schedule_forced_close(registry: &ConnectionRegistry, connection_id: ConnectionId, shutdown_grace: Duration) {
	let registry = registry.clone();
	tokio::spawn(async move {
		tokio::time::sleep(shutdown_grace).await;
		registry.abort(connection_id);
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_status_line_and_forced_headers() {
		let bytes = render(
			http::StatusCode::NOT_FOUND,
			"Target website does not exist",
			"ProxyChain",
			&[],
		);
		let text = String::from_utf8(bytes).unwrap();
		assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
		assert!(text.contains("Content-Length: 30\r\n"));
		assert!(text.contains("Connection: close\r\n"));
		assert!(text.contains("Server: ProxyChain\r\n"));
		assert!(text.ends_with("Target website does not exist"));
	}

	#[test]
	fn extra_header_with_same_name_overrides_default() {
		let bytes = render(
			http::StatusCode::OK,
			"",
			"ProxyChain",
			&[("Content-Type".to_string(), "application/json".to_string())],
		);
		let text = String::from_utf8(bytes).unwrap();
		assert!(text.contains("Content-Type: application/json\r\n"));
		assert!(!text.contains("text/plain"));
	}

	#[test]
	fn proxy_authenticate_header_is_appended() {
		let bytes = render(
			http::StatusCode::PROXY_AUTHENTICATION_REQUIRED,
			"Proxy credentials required.",
			"ProxyChain",
			&[("Proxy-Authenticate".to_string(), "Basic realm=\"ProxyChain\"".to_string())],
		);
		let text = String::from_utf8(bytes).unwrap();
		assert!(text.contains("Proxy-Authenticate: Basic realm=\"ProxyChain\"\r\n"));
	}

	#[tokio::test]
	async fn write_and_schedule_destroy_sends_bytes_and_half_closes() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		let events = crate::events::EventBus::default();
		let registry = ConnectionRegistry::new(events);
		let abort = tokio::spawn(async { std::future::pending::<()>().await }).abort_handle();
		let (connection_id, _counter, _guard) = registry.register(abort);

		write_and_schedule_destroy(
			&mut server,
			http::StatusCode::BAD_GATEWAY,
			"Failed to connect to upstream proxy",
			"ProxyChain",
			&[],
			&registry,
			connection_id,
			Duration::from_millis(5),
		)
		.await
		.unwrap();

		let mut buf = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut client, &mut buf).await.unwrap();
		let text = String::from_utf8(buf).unwrap();
		assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
		assert!(text.ends_with("Failed to connect to upstream proxy"));
	}
}
