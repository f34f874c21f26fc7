use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::policy::{PolicyInput, PolicyResult};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The embedder-supplied decision callback. May be synchronous (return an
/// already-resolved future) or genuinely asynchronous — the core never assumes either.
pub type Policy = Arc<dyn Fn(PolicyInput) -> BoxFuture<'static, anyhow::Result<PolicyResult>> + Send + Sync>;

/// Wraps a plain async closure as a [`Policy`] without the caller having to box the
/// future by hand.
pub fn policy_fn<F, Fut>(f: F) -> Policy
where
	F: Fn(PolicyInput) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<PolicyResult>> + Send + 'static,
{
	Arc::new(move |input| Box::pin(f(input)) as BoxFuture<'static, anyhow::Result<PolicyResult>>)
}

/// Immutable-after-construction server configuration (spec.md §3).
#[derive(Clone)]
pub struct ServerConfig {
	pub port: u16,
	pub auth_realm: String,
	pub verbose: bool,
	pub policy: Option<Policy>,
	/// Grace period between writing a raw error response and forcibly destroying the
	/// socket (spec.md §4.2). Defaults to the 1000ms the spec names; tests shrink it.
	pub shutdown_grace: Duration,
	/// Ceiling on idle time for an outbound (target-side) dial. Not named directly by
	/// spec.md, but every handler that opens a socket needs *some* bound or a dead
	/// target wedges a connection slot forever.
	pub client_timeout: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			port: 8000,
			auth_realm: "ProxyChain".to_string(),
			verbose: false,
			policy: None,
			shutdown_grace: Duration::from_millis(1000),
			client_timeout: Duration::from_secs(30),
		}
	}
}

impl ServerConfig {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_port(mut self, port: u16) -> Self {
		self.port = port;
		self
	}

	pub fn with_auth_realm(mut self, realm: impl Into<String>) -> Self {
		self.auth_realm = realm.into();
		self
	}

	pub fn with_verbose(mut self, verbose: bool) -> Self {
		self.verbose = verbose;
		self
	}

	pub fn with_policy(mut self, policy: Policy) -> Self {
		self.policy = Some(policy);
		self
	}
}
