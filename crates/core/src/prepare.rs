//! Parses the request target and merges the policy's decision into the final
//! [`HandlerOptions`] the Dispatcher routes on.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

use crate::error::RequestError;
use crate::policy::{CustomResponseFn, PolicyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
	Http,
	Socks,
}

#[derive(Debug, Clone)]
pub struct UpstreamProxy {
	pub scheme: UpstreamScheme,
	pub host: String,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
}

impl UpstreamProxy {
	pub fn parse(raw: &str) -> anyhow::Result<Self> {
		let url = url::Url::parse(raw)
			.map_err(|e| anyhow::anyhow!("invalid upstream proxy URL \"{raw}\": {e}"))?;
		let scheme = match url.scheme() {
			"http" => UpstreamScheme::Http,
			"socks" | "socks5" => UpstreamScheme::Socks,
			other => anyhow::bail!("upstream proxy scheme must be http or socks (was {other})"),
		};
		let host = url
			.host_str()
			.ok_or_else(|| anyhow::anyhow!("upstream proxy URL \"{raw}\" has no host"))?
			.to_string();
		let port = url
			.port_or_known_default()
			.unwrap_or(if scheme == UpstreamScheme::Http { 80 } else { 1080 });
		let username = (!url.username().is_empty()).then(|| url.username().to_string());
		let password = url.password().map(|p| p.to_string());
		Ok(Self {
			scheme,
			host,
			port,
			username,
			password,
		})
	}
}

#[derive(Debug, Clone)]
pub struct TargetParsed {
	pub scheme: String,
	pub host: String,
	pub port: u16,
	pub path_and_query: Option<String>,
}

// src_head is non-empty only for the CONNECT path: bytes already read off the wire
// past the request line.
#[derive(Clone)]
pub struct HandlerOptions {
	pub id: u64,
	pub connection_id: crate::id::ConnectionId,
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub src_head: Option<Bytes>,
	pub target: TargetParsed,
	pub is_http: bool,
	pub upstream_proxy: Option<UpstreamProxy>,
	pub custom_response_function: Option<CustomResponseFn>,
	pub local_address: Option<String>,
}

#[derive(Debug)]
pub enum PrepareError {
	Request(RequestError),
	Configuration(anyhow::Error),
}

impl From<RequestError> for PrepareError {
	fn from(e: RequestError) -> Self {
		PrepareError::Request(e)
	}
}

#[derive(Default)]
pub struct RequestCounters {
	http: AtomicU64,
	connect: AtomicU64,
}

impl RequestCounters {
	pub fn http_count(&self) -> u64 {
		self.http.load(Ordering::Relaxed)
	}

	pub fn connect_count(&self) -> u64 {
		self.connect.load(Ordering::Relaxed)
	}
}

pub struct RequestPreparer<'a> {
	pub auth_realm: &'a str,
	pub counters: &'a RequestCounters,
}

impl<'a> RequestPreparer<'a> {
	pub fn new(auth_realm: &'a str, counters: &'a RequestCounters) -> Self {
		Self { auth_realm, counters }
	}

	pub fn parse_connect_target(&self, authority: &str) -> Result<TargetParsed, RequestError> {
		let synthetic = format!("proxychain://{authority}");
		let url = url::Url::parse(&synthetic)
			.map_err(|_| RequestError::bad_request(format!("Target \"{authority}\" could not be parsed")))?;
		let host = url.host_str().unwrap_or_default().to_string();
		let port = url.port();
		if host.is_empty() || port.is_none() {
			return Err(RequestError::bad_request(format!(
				"Target \"{authority}\" could not be parsed"
			)));
		}
		self.counters.connect.fetch_add(1, Ordering::Relaxed);
		Ok(TargetParsed {
			scheme: String::new(),
			host,
			port: port.unwrap(),
			path_and_query: None,
		})
	}

	pub fn parse_http_target(&self, uri: &Uri) -> Result<TargetParsed, RequestError> {
		let url = url::Url::parse(&uri.to_string())
			.map_err(|_| RequestError::bad_request(format!("Target \"{uri}\" could not be parsed")))?;
		let scheme = url.scheme().to_string();
		if scheme != "http" {
			return Err(RequestError::bad_request(format!(
				"Only HTTP protocol is supported (was {scheme}:)"
			)));
		}
		let host = url.host_str().unwrap_or_default().to_string();
		if host.is_empty() {
			return Err(RequestError::bad_request(format!(
				"Target \"{uri}\" could not be parsed"
			)));
		}
		let port = url.port_or_known_default().unwrap_or(80);
		let mut path_and_query = url.path().to_string();
		if let Some(query) = url.query() {
			path_and_query.push('?');
			path_and_query.push_str(query);
		}
		self.counters.http.fetch_add(1, Ordering::Relaxed);
		Ok(TargetParsed {
			scheme,
			host,
			port,
			path_and_query: Some(path_and_query),
		})
	}

	#[allow(clippy::too_many_arguments)]
	pub fn merge_policy(
		&self,
		id: u64,
		connection_id: crate::id::ConnectionId,
		method: Method,
		uri: Uri,
		headers: HeaderMap,
		src_head: Option<Bytes>,
		target: TargetParsed,
		is_http: bool,
		policy: PolicyResult,
	) -> Result<HandlerOptions, PrepareError> {
		if policy.request_authentication {
			return Err(PrepareError::Request(RequestError::proxy_auth_required(
				policy
					.fail_msg
					.unwrap_or_else(|| "Proxy credentials required.".to_string()),
				self.auth_realm,
			)));
		}

		let upstream_proxy = policy
			.upstream_proxy_url
			.as_deref()
			.map(UpstreamProxy::parse)
			.transpose()
			.map_err(PrepareError::Configuration)?;

		if policy.custom_response_function.is_some() {
			if !is_http {
				return Err(PrepareError::Configuration(anyhow::anyhow!(
					"customResponseFunction cannot be used with a CONNECT request"
				)));
			}
			if upstream_proxy.is_some() {
				return Err(PrepareError::Configuration(anyhow::anyhow!(
					"customResponseFunction and upstreamProxyUrl cannot both be set"
				)));
			}
		}

		Ok(HandlerOptions {
			id,
			connection_id,
			method,
			uri,
			headers,
			src_head,
			target,
			is_http,
			upstream_proxy,
			custom_response_function: policy.custom_response_function,
			local_address: policy.local_address,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn counters() -> RequestCounters {
		RequestCounters::default()
	}

	#[test]
	fn connect_target_parses_host_and_port() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let target = preparer.parse_connect_target("secure.test:443").unwrap();
		assert_eq!(target.host, "secure.test");
		assert_eq!(target.port, 443);
		assert_eq!(counters.connect_count(), 1);
	}

	#[test]
	fn connect_target_without_port_fails() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let err = preparer.parse_connect_target("secure.test").unwrap_err();
		assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
		assert!(err.message.contains("could not be parsed"));
	}

	#[test]
	fn http_target_rejects_non_http_scheme() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let uri: Uri = "ftp://x/".parse().unwrap();
		let err = preparer.parse_http_target(&uri).unwrap_err();
		assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
		assert_eq!(err.message, "Only HTTP protocol is supported (was ftp:)");
	}

	#[test]
	fn http_target_parses_absolute_form() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let uri: Uri = "http://example.test/x".parse().unwrap();
		let target = preparer.parse_http_target(&uri).unwrap();
		assert_eq!(target.host, "example.test");
		assert_eq!(target.path_and_query.as_deref(), Some("/x"));
		assert_eq!(counters.http_count(), 1);
	}

	#[test]
	fn request_authentication_yields_407() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let target = preparer.parse_http_target(&"http://example.test/".parse().unwrap()).unwrap();
		let policy = PolicyResult {
			request_authentication: true,
			fail_msg: Some("go away".to_string()),
			..Default::default()
		};
		let err = preparer
			.merge_policy(
				1,
				crate::id::ConnectionIdGenerator::new().next(),
				Method::GET,
				"http://example.test/".parse().unwrap(),
				HeaderMap::new(),
				None,
				target,
				true,
				policy,
			)
			.unwrap_err();
		match err {
			PrepareError::Request(e) => {
				assert_eq!(e.status, http::StatusCode::PROXY_AUTHENTICATION_REQUIRED);
				assert_eq!(e.message, "go away");
				assert!(e.headers.iter().any(|(k, v)| k == "Proxy-Authenticate"
					&& v == "Basic realm=\"ProxyChain\""));
			},
			_ => panic!("expected a RequestError"),
		}
	}

	#[test]
	fn custom_response_with_connect_is_a_configuration_error() {
		let counters = counters();
		let preparer = RequestPreparer::new("ProxyChain", &counters);
		let target = preparer.parse_connect_target("secure.test:443").unwrap();
		let policy = PolicyResult {
			custom_response_function: Some(std::sync::Arc::new(|_, _, _| {
				Box::pin(async { Err(anyhow::anyhow!("should never run")) })
			})),
			..Default::default()
		};
		let err = preparer
			.merge_policy(
				1,
				crate::id::ConnectionIdGenerator::new().next(),
				Method::CONNECT,
				"secure.test:443".parse().unwrap(),
				HeaderMap::new(),
				Some(Bytes::new()),
				target,
				false,
				policy,
			)
			.unwrap_err();
		assert!(matches!(err, PrepareError::Configuration(_)));
	}
}
