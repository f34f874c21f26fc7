//! Error taxonomy (spec.md §7) and the normalizer (spec.md §4.6) that turns a handler's
//! typed failure into the wire-visible [`RequestError`] the Dispatcher writes back.

use http::StatusCode;

/// A request-scoped failure the Dispatcher knows how to answer on the wire: a status
/// line, any extra headers (e.g. `Proxy-Authenticate` on a 407), and a plain-text body.
#[derive(Debug, Clone)]
pub struct RequestError {
	pub status: StatusCode,
	pub headers: Vec<(String, String)>,
	pub message: String,
}

impl std::fmt::Display for RequestError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}: {}", self.status, self.message)
	}
}

impl std::error::Error for RequestError {}

impl RequestError {
	pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status,
			headers: Vec::new(),
			message: message.into(),
		}
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, message)
	}

	pub fn proxy_auth_required(message: impl Into<String>, realm: &str) -> Self {
		Self::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED, message)
			.with_header("Proxy-Authenticate", format!("Basic realm=\"{realm}\""))
	}

	pub fn bad_gateway(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_GATEWAY, message)
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(StatusCode::NOT_FOUND, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
	}
}

/// Failures a transport handler can raise that carry enough lower-layer detail for
/// [`ErrorNormalizer`] to translate into a specific client-visible status, rather than
/// the generic 500 every other handler failure collapses to. Handlers that want the
/// generic-500 treatment just propagate `anyhow::Error` directly (via `HandlerError::Other`).
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
	#[error("Username contains an invalid colon")]
	UpstreamUsernameInvalidColon,
	#[error("407 Proxy Authentication Required")]
	UpstreamAuthRejected,
	#[error("upstream proxy DNS lookup failed: {0}")]
	UpstreamProxyDnsNotFound(String),
	#[error("target DNS lookup failed: {0}")]
	TargetDnsNotFound(String),
	#[error("failed to connect to upstream proxy {0}")]
	UpstreamProxyConnectFailed(String),
	#[error("failed to connect to target {0}")]
	TargetConnectFailed(String),
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

/// Maps the four lower-layer error signatures spec.md §4.6 names into a typed
/// [`RequestError`]. Anything else is handed back unchanged (as the wrapped
/// `anyhow::Error`) so the Dispatcher's generic `requestFailed` + 500 path handles it.
pub struct ErrorNormalizer;

impl ErrorNormalizer {
	pub fn normalize(err: HandlerError) -> Result<RequestError, anyhow::Error> {
		match err {
			HandlerError::UpstreamUsernameInvalidColon => Ok(RequestError::bad_gateway(
				"Invalid colon in username in upstream proxy credentials",
			)),
			HandlerError::UpstreamAuthRejected => {
				Ok(RequestError::bad_gateway("Invalid upstream proxy credentials"))
			},
			HandlerError::UpstreamProxyDnsNotFound(_) => {
				Ok(RequestError::bad_gateway("Failed to connect to upstream proxy"))
			},
			HandlerError::TargetDnsNotFound(_) => {
				Ok(RequestError::not_found("Target website does not exist"))
			},
			HandlerError::UpstreamProxyConnectFailed(_) => {
				Ok(RequestError::bad_gateway("Failed to connect to upstream proxy"))
			},
			HandlerError::TargetConnectFailed(_) => {
				Ok(RequestError::bad_gateway("Failed to connect to target"))
			},
			HandlerError::Other(e) => Err(e),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn dns_not_found_without_proxy_marker_is_404() {
		let normalized =
			ErrorNormalizer::normalize(HandlerError::TargetDnsNotFound("example.test".into()))
				.expect("should normalize to a RequestError");
		assert_eq!(normalized.status, StatusCode::NOT_FOUND);
		assert_eq!(normalized.message, "Target website does not exist");
	}

	#[test]
	fn upstream_proxy_dns_failure_is_502() {
		let normalized =
			ErrorNormalizer::normalize(HandlerError::UpstreamProxyDnsNotFound("up.test".into()))
				.expect("should normalize to a RequestError");
		assert_eq!(normalized.status, StatusCode::BAD_GATEWAY);
		assert_eq!(normalized.message, "Failed to connect to upstream proxy");
	}

	#[test]
	fn target_connect_failure_is_502_not_404() {
		let normalized = ErrorNormalizer::normalize(HandlerError::TargetConnectFailed("example.test".into()))
			.expect("should normalize to a RequestError");
		assert_eq!(normalized.status, StatusCode::BAD_GATEWAY);
		assert_eq!(normalized.message, "Failed to connect to target");
	}

	#[test]
	fn upstream_proxy_connect_failure_is_502() {
		let normalized = ErrorNormalizer::normalize(HandlerError::UpstreamProxyConnectFailed("up.test".into()))
			.expect("should normalize to a RequestError");
		assert_eq!(normalized.status, StatusCode::BAD_GATEWAY);
		assert_eq!(normalized.message, "Failed to connect to upstream proxy");
	}

	#[test]
	fn opaque_errors_pass_through_unnormalized() {
		let err = ErrorNormalizer::normalize(HandlerError::Other(anyhow::anyhow!("boom")));
		assert!(err.is_err());
	}
}
