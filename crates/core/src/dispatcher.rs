use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, Uri};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::body::{box_body, ProxyBody};
use crate::config::ServerConfig;
use crate::connect_request;
use crate::copy;
use crate::error::{ErrorNormalizer, HandlerError, RequestError};
use crate::events::{EventBus, RequestFailedEvent};
use crate::handlers::{self, Strategy};
use crate::id::{ConnectionId, HandlerIdGenerator};
use crate::policy::PolicyInvoker;
use crate::prepare::{HandlerOptions, PrepareError, RequestCounters, RequestPreparer};
use crate::raw_response;
use crate::registry::ConnectionRegistry;

enum Failure {
	Request(RequestError),
	Internal(anyhow::Error),
}

impl From<RequestError> for Failure {
	fn from(e: RequestError) -> Self {
		Failure::Request(e)
	}
}

impl From<PrepareError> for Failure {
	fn from(e: PrepareError) -> Self {
		match e {
			PrepareError::Request(e) => Failure::Request(e),
			PrepareError::Configuration(e) => Failure::Internal(e),
		}
	}
}

impl From<anyhow::Error> for Failure {
	fn from(e: anyhow::Error) -> Self {
		Failure::Internal(e)
	}
}

fn normalize_handler_error(err: HandlerError) -> Failure {
	match ErrorNormalizer::normalize(err) {
		Ok(req_err) => Failure::Request(req_err),
		Err(e) => Failure::Internal(e),
	}
}

#[derive(Clone)]
pub struct Dispatcher {
	auth_realm: String,
	shutdown_grace: Duration,
	client_timeout: Duration,
	registry: ConnectionRegistry,
	events: EventBus,
	counters: std::sync::Arc<RequestCounters>,
	handler_ids: std::sync::Arc<HandlerIdGenerator>,
	policy: std::sync::Arc<PolicyInvoker>,
}

impl Dispatcher {
	pub fn new(config: &ServerConfig, registry: ConnectionRegistry, events: EventBus) -> Self {
		Self {
			auth_realm: config.auth_realm.clone(),
			shutdown_grace: config.shutdown_grace,
			client_timeout: config.client_timeout,
			registry,
			events,
			counters: std::sync::Arc::new(RequestCounters::default()),
			handler_ids: std::sync::Arc::new(HandlerIdGenerator::new()),
			policy: std::sync::Arc::new(PolicyInvoker::new(config.policy.clone())),
		}
	}

	pub fn http_request_count(&self) -> u64 {
		self.counters.http_count()
	}

	pub fn connect_request_count(&self) -> u64 {
		self.counters.connect_count()
	}

	pub async fn on_request(
		&self,
		connection_id: ConnectionId,
		req: Request<hyper::body::Incoming>,
	) -> Response<ProxyBody> {
		let (parts, body) = req.into_parts();
		let method = parts.method.clone();
		let uri = parts.uri.clone();
		let req = Request::from_parts(parts, box_body(body));

		match self.prepare_http(connection_id, req.method().clone(), req.uri().clone(), req.headers().clone()).await {
			Ok(options) => match self.run_http_handler(options, req).await {
				Ok((response, counter)) => {
					if let Some(counter) = counter {
						self.registry.attach_target_counter(connection_id, counter);
					}
					response
				},
				Err(err) => self.fail_http(connection_id, &method, &uri, normalize_handler_error(err)),
			},
			Err(failure) => self.fail_http(connection_id, &method, &uri, failure),
		}
	}

	async fn prepare_http(
		&self,
		connection_id: ConnectionId,
		method: Method,
		uri: Uri,
		headers: HeaderMap,
	) -> Result<HandlerOptions, Failure> {
		let preparer = RequestPreparer::new(&self.auth_realm, &self.counters);
		let target = preparer.parse_http_target(&uri)?;

		let input = PolicyInvoker::build_input(
			connection_id,
			&method,
			&uri,
			&headers,
			target.host.clone(),
			target.port,
			true,
		)?;
		let policy_result = self.policy.invoke(input).await?;

		let id = self.handler_ids.next().value();
		let options = preparer.merge_policy(id, connection_id, method, uri, headers, None, target, true, policy_result)?;
		Ok(options)
	}

	async fn run_http_handler(
		&self,
		options: HandlerOptions,
		req: Request<ProxyBody>,
	) -> Result<(Response<ProxyBody>, Option<crate::byte_counter::ByteCounter>), HandlerError> {
		match handlers::select(&options) {
			Strategy::CustomResponse => handlers::custom_response::respond(&options, &req).await.map(|r| (r, None)),
			Strategy::ForwardSocks => handlers::forward_socks::forward(&options, req, self.client_timeout)
				.await
				.map(|(r, c)| (r, Some(c))),
			Strategy::Forward => match &options.upstream_proxy {
				Some(_) => handlers::forward::forward(&options, req, self.client_timeout)
					.await
					.map(|(r, c)| (r, Some(c))),
				None => handlers::direct::forward(&options, req, self.client_timeout)
					.await
					.map(|(r, c)| (r, Some(c))),
			},
			Strategy::Direct | Strategy::Chain | Strategy::TunnelSocks => {
				unreachable!("an HTTP-form request never selects a CONNECT-only strategy")
			},
		}
	}

	fn fail_http(&self, connection_id: ConnectionId, method: &Method, uri: &Uri, failure: Failure) -> Response<ProxyBody> {
		let response = match failure {
			Failure::Request(err) => raw_response::hyper_response(err.status, &err.message, &self.auth_realm, &err.headers),
			Failure::Internal(err) => {
				tracing::error!(target: "proxychain::dispatcher", error = %err, %method, %uri, "request failed internally");
				self.events.emit_request_failed(RequestFailedEvent {
					error: err.to_string(),
					method: Some(method.to_string()),
					uri: Some(uri.to_string()),
				});
				raw_response::hyper_response(
					http::StatusCode::INTERNAL_SERVER_ERROR,
					"Internal error in proxy server",
					&self.auth_realm,
					&[],
				)
			},
		};
		raw_response::schedule_forced_close(&self.registry, connection_id, self.shutdown_grace);
		response
	}

	pub async fn on_connect<S>(&self, connection_id: ConnectionId, stream: &mut S)
	where
		S: AsyncRead + AsyncWrite + Unpin + Send,
	{
		let (connect_req, _) = match connect_request::read(stream).await {
			Ok(parsed) => parsed,
			Err(err) => {
				self.fail_connect(connection_id, stream, Method::CONNECT, None, err.into()).await;
				return;
			},
		};

		let uri = match connect_request::authority_uri(&connect_req.authority) {
			Ok(uri) => uri,
			Err(err) => {
				self.fail_connect(connection_id, stream, Method::CONNECT, None, err.into()).await;
				return;
			},
		};

		match self.prepare_connect(connection_id, uri.clone(), connect_req.headers).await {
			Ok(options) => match self.run_connect_handler(&options).await {
				Ok((target, counter)) => {
					self.registry.attach_target_counter(connection_id, counter);
					if let Err(e) = stream.write_all(raw_response::CONNECT_ESTABLISHED).await {
						tracing::debug!(target: "proxychain::dispatcher", error = %e, "failed writing CONNECT established response");
						return;
					}
					if let Err(e) = copy::relay(stream, target).await {
						tracing::debug!(target: "proxychain::dispatcher", error = %e, "CONNECT relay ended with an error");
					}
				},
				Err(err) => {
					self.fail_connect(connection_id, stream, Method::CONNECT, Some(uri), normalize_handler_error(err)).await;
				},
			},
			Err(failure) => {
				self.fail_connect(connection_id, stream, Method::CONNECT, Some(uri), failure).await;
			},
		}
	}

	async fn prepare_connect(
		&self,
		connection_id: ConnectionId,
		uri: Uri,
		headers: HeaderMap,
	) -> Result<HandlerOptions, Failure> {
		let preparer = RequestPreparer::new(&self.auth_realm, &self.counters);
		let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
		let target = preparer.parse_connect_target(authority)?;

		let input = PolicyInvoker::build_input(
			connection_id,
			&Method::CONNECT,
			&uri,
			&headers,
			target.host.clone(),
			target.port,
			false,
		)?;
		let policy_result = self.policy.invoke(input).await?;

		let id = self.handler_ids.next().value();
		let options = preparer.merge_policy(
			id,
			connection_id,
			Method::CONNECT,
			uri,
			headers,
			Some(Bytes::new()),
			target,
			false,
			policy_result,
		)?;
		Ok(options)
	}

	async fn run_connect_handler(
		&self,
		options: &HandlerOptions,
	) -> Result<(Box<dyn handlers::AsyncDuplex>, crate::byte_counter::ByteCounter), HandlerError> {
		match handlers::select(options) {
			Strategy::Direct => handlers::direct::dial(&options.target, options.local_address.as_deref(), self.client_timeout).await,
			Strategy::Chain => handlers::chain::dial(options, self.client_timeout).await,
			Strategy::TunnelSocks => handlers::tunnel_socks::dial(options, self.client_timeout).await,
			Strategy::Forward | Strategy::ForwardSocks | Strategy::CustomResponse => {
				unreachable!("a CONNECT request never selects an HTTP-form-only strategy")
			},
		}
	}

	async fn fail_connect<S>(&self, connection_id: ConnectionId, stream: &mut S, method: Method, uri: Option<Uri>, failure: Failure)
	where
		S: AsyncWrite + Unpin,
	{
		let (status, message, headers) = match failure {
			Failure::Request(err) => (err.status, err.message, err.headers),
			Failure::Internal(err) => {
				tracing::error!(target: "proxychain::dispatcher", error = %err, %method, uri = ?uri, "CONNECT failed internally");
				self.events.emit_request_failed(RequestFailedEvent {
					error: err.to_string(),
					method: Some(method.to_string()),
					uri: uri.as_ref().map(|u| u.to_string()),
				});
				(
					http::StatusCode::INTERNAL_SERVER_ERROR,
					"Internal error in proxy server".to_string(),
					Vec::new(),
				)
			},
		};

		if let Err(e) = raw_response::write_and_schedule_destroy(
			stream,
			status,
			&message,
			&self.auth_realm,
			&headers,
			&self.registry,
			connection_id,
			self.shutdown_grace,
		)
		.await
		{
			tracing::debug!(target: "proxychain::dispatcher", error = %e, "failed writing raw CONNECT error response");
		}
	}
}
