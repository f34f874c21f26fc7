//! End-to-end scenarios from spec.md §8: a real `TcpListener` bound by `Server::listen`,
//! driven with a plain `tokio::net::TcpStream` client and small hand-rolled origin/SOCKS
//! stand-ins, so these exercise the actual accept loop, sniffing, and dispatch rather
//! than any one component in isolation.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxychain::{policy_fn, PolicyResult, Server, ServerConfig};

/// Accepts one connection and answers any request on it with a fixed 200 response
/// carrying `body`. Exits after the one exchange.
async fn spawn_once_origin(body: &'static str) -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		let (mut stream, _) = listener.accept().await.unwrap();
		let mut buf = vec![0u8; 4096];
		let mut read = 0;
		loop {
			let n = stream.read(&mut buf[read..]).await.unwrap();
			read += n;
			if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
				break;
			}
		}
		let response = format!(
			"HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
			body.len(),
			body
		);
		stream.write_all(response.as_bytes()).await.unwrap();
		let _ = stream.shutdown().await;
	});
	port
}

/// Accepts connections and echoes back whatever it reads, forever — used as the "real
/// target" behind a CONNECT tunnel (direct or chained through the fake SOCKS server).
async fn spawn_echo_origin() -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		loop {
			let (mut stream, _) = match listener.accept().await {
				Ok(v) => v,
				Err(_) => return,
			};
			tokio::spawn(async move {
				let mut buf = [0u8; 1024];
				loop {
					let n = match stream.read(&mut buf).await {
						Ok(0) | Err(_) => return,
						Ok(n) => n,
					};
					if stream.write_all(&buf[..n]).await.is_err() {
						return;
					}
				}
			});
		}
	});
	port
}

/// A minimal SOCKS5 server: accepts the no-auth handshake and any CONNECT request
/// (ignoring the requested target entirely), replies "succeeded", then splices the
/// client to `real_target_port` on localhost. Enough to prove the proxy speaks the
/// client half of RFC 1928 correctly; not a real SOCKS router.
async fn spawn_fake_socks_server(real_target_port: u16) -> u16 {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		loop {
			let (mut client, _) = match listener.accept().await {
				Ok(v) => v,
				Err(_) => return,
			};
			tokio::spawn(async move {
				let mut greeting = [0u8; 2];
				if client.read_exact(&mut greeting).await.is_err() {
					return;
				}
				let nmethods = greeting[1] as usize;
				let mut methods = vec![0u8; nmethods];
				if client.read_exact(&mut methods).await.is_err() {
					return;
				}
				if client.write_all(&[0x05, 0x00]).await.is_err() {
					return;
				}

				let mut head = [0u8; 4];
				if client.read_exact(&mut head).await.is_err() {
					return;
				}
				match head[3] {
					0x01 => {
						let mut rest = [0u8; 4 + 2];
						let _ = client.read_exact(&mut rest).await;
					},
					0x04 => {
						let mut rest = [0u8; 16 + 2];
						let _ = client.read_exact(&mut rest).await;
					},
					0x03 => {
						let mut len = [0u8; 1];
						if client.read_exact(&mut len).await.is_err() {
							return;
						}
						let mut rest = vec![0u8; len[0] as usize + 2];
						let _ = client.read_exact(&mut rest).await;
					},
					_ => return,
				}

				let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
				if client.write_all(&reply).await.is_err() {
					return;
				}

				let Ok(mut target) = TcpStream::connect(("127.0.0.1", real_target_port)).await else {
					return;
				};
				let _ = tokio::io::copy_bidirectional(&mut client, &mut target).await;
			});
		}
	});
	port
}

/// Reads a full HTTP/1.1 response: headers up to the blank line, then exactly
/// `Content-Length` more bytes of body (falling back to "read until EOF or quiet" if the
/// response carries no `Content-Length`, as the CONNECT-established line does not).
async fn read_http_response(stream: &mut TcpStream) -> String {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];

	let header_end = loop {
		let n = stream.read(&mut chunk).await.unwrap();
		assert!(n > 0, "connection closed before headers completed");
		buf.extend_from_slice(&chunk[..n]);
		if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
			break pos + 4;
		}
	};

	let head_text = String::from_utf8_lossy(&buf[..header_end]).to_string();
	let content_length = head_text
		.lines()
		.find_map(|line| line.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
		.and_then(|v| v.parse::<usize>().ok());

	if let Some(len) = content_length {
		while buf.len() < header_end + len {
			let n = stream.read(&mut chunk).await.unwrap();
			assert!(n > 0, "connection closed before body completed");
			buf.extend_from_slice(&chunk[..n]);
		}
	}

	String::from_utf8_lossy(&buf).to_string()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

/// S1 — forward HTTP, no policy: an absolute-form `GET` reaches the target directly.
#[tokio::test]
async fn forward_http_with_no_policy_reaches_target() {
	let origin_port = spawn_once_origin("hello").await;
	let server = Server::listen(ServerConfig::new().with_port(0)).await.unwrap();

	let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
	let request = format!("GET http://127.0.0.1:{origin_port}/x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n");
	client.write_all(request.as_bytes()).await.unwrap();

	let response = read_http_response(&mut client).await;
	assert!(response.starts_with("HTTP/1.1 200"));
	assert!(response.ends_with("hello"));
	assert_eq!(server.http_request_count(), 1);

	server.close(true).await;
}

/// S2 — CONNECT with a SOCKS upstream: the dispatcher must pick `tunnelSocks`, not
/// `chain`, and the resulting tunnel must actually carry bytes end to end.
#[tokio::test]
async fn connect_with_socks_upstream_tunnels_through_it() {
	let echo_port = spawn_echo_origin().await;
	let socks_port = spawn_fake_socks_server(echo_port).await;

	let policy = policy_fn(move |_input| async move {
		Ok(PolicyResult {
			upstream_proxy_url: Some(format!("socks://127.0.0.1:{socks_port}")),
			..Default::default()
		})
	});
	let server = Server::listen(ServerConfig::new().with_port(0).with_policy(policy)).await.unwrap();

	let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
	client.write_all(b"CONNECT secure.test:443 HTTP/1.1\r\n\r\n").await.unwrap();

	let mut head = vec![0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
	client.read_exact(&mut head).await.unwrap();
	assert_eq!(&head[..], b"HTTP/1.1 200 Connection Established\r\n\r\n");

	client.write_all(b"ping").await.unwrap();
	let mut echoed = [0u8; 4];
	client.read_exact(&mut echoed).await.unwrap();
	assert_eq!(&echoed, b"ping");
	assert_eq!(server.connect_request_count(), 1);

	server.close(true).await;
}

/// S3 — authentication challenge: a policy requesting auth yields a 407 with the
/// `Proxy-Authenticate` challenge and the policy's own failure message as the body.
#[tokio::test]
async fn policy_requesting_authentication_yields_407() {
	let policy = policy_fn(|_input| async move {
		Ok(PolicyResult {
			request_authentication: true,
			fail_msg: Some("go away".to_string()),
			..Default::default()
		})
	});
	let server = Server::listen(ServerConfig::new().with_port(0).with_policy(policy)).await.unwrap();

	let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
	client
		.write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
		.await
		.unwrap();

	let response = read_http_response(&mut client).await;
	assert!(response.starts_with("HTTP/1.1 407 Proxy Authentication Required\r\n"));
	assert!(response.contains("proxy-authenticate: Basic realm=\"ProxyChain\"\r\n") || response.contains("Proxy-Authenticate: Basic realm=\"ProxyChain\"\r\n"));
	assert!(response.contains("connection: close\r\n") || response.contains("Connection: close\r\n"));
	assert!(response.ends_with("go away"));

	server.close(true).await;
}

/// S4 — invalid target scheme: a non-`http` absolute-form target fails parsing before
/// any handler runs.
#[tokio::test]
async fn non_http_scheme_yields_400() {
	let server = Server::listen(ServerConfig::new().with_port(0)).await.unwrap();

	let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
	client.write_all(b"GET ftp://x/ HTTP/1.1\r\n\r\n").await.unwrap();

	let response = read_http_response(&mut client).await;
	assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
	assert!(response.ends_with("Only HTTP protocol is supported (was ftp:)"));

	server.close(true).await;
}

/// S5 — DNS failure to target: `.invalid` is reserved by RFC 2606 to never resolve, so
/// the direct handler's dial always fails DNS lookup here, yielding the normalized 404.
#[tokio::test]
async fn dns_failure_to_target_yields_404() {
	let server = Server::listen(ServerConfig::new().with_port(0)).await.unwrap();

	let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
	client
		.write_all(b"GET http://host.invalid/ HTTP/1.1\r\nHost: host.invalid\r\n\r\n")
		.await
		.unwrap();

	let response = read_http_response(&mut client).await;
	assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
	assert!(response.ends_with("Target website does not exist"));

	server.close(true).await;
}

/// S6 / invariant 5 — abrupt shutdown: with N live CONNECT tunnels, `close(true)` forces
/// every one down, `getConnectionIds()` is empty afterward, and no further accepts
/// happen once it returns.
#[tokio::test]
async fn force_close_tears_down_every_live_tunnel() {
	let echo_port = spawn_echo_origin().await;
	let mut config = ServerConfig::new().with_port(0);
	config.shutdown_grace = Duration::from_millis(20);
	let server = Server::listen(config).await.unwrap();

	let mut clients = Vec::new();
	for _ in 0..3 {
		let mut client = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
		let request = format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\n\r\n");
		client.write_all(request.as_bytes()).await.unwrap();
		let mut head = vec![0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
		client.read_exact(&mut head).await.unwrap();
		clients.push(client);
	}

	// Give the registry a moment to register all three before forcing them down.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(server.connection_ids().len(), 3);

	server.close(true).await;
	assert!(server.connection_ids().is_empty());

	// The listener is gone: a further connect attempt must fail (either refused or, at
	// worst, never accepted).
	let refused = TcpStream::connect(("127.0.0.1", server.port())).await;
	assert!(refused.is_err());
}
