//! Normalizes an inbound request into a [`PolicyInput`] and invokes the embedder's
//! decision callback.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::Engine;
use http::{HeaderMap, Method, Uri};

use crate::body::ProxyBody;
use crate::config::Policy;
use crate::error::RequestError;
use crate::id::ConnectionId;

pub type CustomResponseFn = Arc<
	dyn Fn(Method, Uri, HeaderMap) -> Pin<Box<dyn Future<Output = anyhow::Result<http::Response<ProxyBody>>> + Send>>
		+ Send
		+ Sync,
>;

#[derive(Clone)]
pub struct PolicyInput {
	pub connection_id: ConnectionId,
	pub method: Method,
	pub uri: Uri,
	pub headers: HeaderMap,
	pub username: String,
	pub password: String,
	pub hostname: String,
	pub port: u16,
	pub is_http: bool,
}

#[derive(Clone, Default)]
pub struct PolicyResult {
	pub request_authentication: bool,
	pub fail_msg: Option<String>,
	pub upstream_proxy_url: Option<String>,
	pub custom_response_function: Option<CustomResponseFn>,
	pub local_address: Option<String>,
}

impl std::fmt::Debug for PolicyResult {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PolicyResult")
			.field("request_authentication", &self.request_authentication)
			.field("fail_msg", &self.fail_msg)
			.field("upstream_proxy_url", &self.upstream_proxy_url)
			.field("custom_response_function", &self.custom_response_function.is_some())
			.field("local_address", &self.local_address)
			.finish()
	}
}

pub struct ProxyCredentials {
	pub username: String,
	pub password: String,
}

// Splits the decoded payload on the first colon only, so a password containing
// colons survives intact.
pub fn parse_proxy_authorization(header_value: &str) -> Result<ProxyCredentials, RequestError> {
	let mut parts = header_value.splitn(2, ' ');
	let scheme = parts.next().unwrap_or_default();
	let payload = parts.next();

	if !scheme.eq_ignore_ascii_case("basic") {
		return Err(RequestError::bad_request(
			"The \"Proxy-Authorization\" header must have the \"Basic\" type.",
		));
	}
	let payload = payload.ok_or_else(|| {
		RequestError::bad_request("Invalid \"Proxy-Authorization\" header")
	})?;

	let decoded = base64::engine::general_purpose::STANDARD
		.decode(payload.trim())
		.map_err(|_| RequestError::bad_request("Invalid \"Proxy-Authorization\" header"))?;
	let decoded = String::from_utf8(decoded)
		.map_err(|_| RequestError::bad_request("Invalid \"Proxy-Authorization\" header"))?;

	match decoded.split_once(':') {
		Some((user, pass)) => Ok(ProxyCredentials {
			username: user.to_string(),
			password: pass.to_string(),
		}),
		None => Err(RequestError::bad_request(
			"Invalid \"Proxy-Authorization\" header",
		)),
	}
}

pub struct PolicyInvoker {
	policy: Option<Policy>,
}

impl PolicyInvoker {
	pub fn new(policy: Option<Policy>) -> Self {
		Self { policy }
	}

	pub fn build_input(
		connection_id: ConnectionId,
		method: &Method,
		uri: &Uri,
		headers: &HeaderMap,
		hostname: impl Into<String>,
		port: u16,
		is_http: bool,
	) -> Result<PolicyInput, RequestError> {
		let (username, password) = match headers.get(http::header::PROXY_AUTHORIZATION) {
			Some(value) => {
				let value = value
					.to_str()
					.map_err(|_| RequestError::bad_request("Invalid \"Proxy-Authorization\" header"))?;
				let creds = parse_proxy_authorization(value)?;
				(creds.username, creds.password)
			},
			None => (String::new(), String::new()),
		};

		Ok(PolicyInput {
			connection_id,
			method: method.clone(),
			uri: uri.clone(),
			headers: headers.clone(),
			username,
			password,
			hostname: hostname.into(),
			port,
			is_http,
		})
	}

	pub async fn invoke(&self, input: PolicyInput) -> anyhow::Result<PolicyResult> {
		match &self.policy {
			None => Ok(PolicyResult::default()),
			Some(policy) => policy(input).await,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_on_first_colon_only() {
		let encoded = base64::engine::general_purpose::STANDARD.encode("u:p:q");
		let header = format!("Basic {encoded}");
		let creds = parse_proxy_authorization(&header).unwrap();
		assert_eq!(creds.username, "u");
		assert_eq!(creds.password, "p:q");
	}

	#[test]
	fn rejects_non_basic_scheme() {
		let encoded = base64::engine::general_purpose::STANDARD.encode("u:p");
		let header = format!("Digest {encoded}");
		let err = parse_proxy_authorization(&header).unwrap_err();
		assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
		assert!(err.message.contains("Basic"));
	}

	#[test]
	fn rejects_malformed_base64() {
		let err = parse_proxy_authorization("Basic not-valid-base64!!").unwrap_err();
		assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
	}
}
