//! The policy supplied its own response function: no network connection is opened at
//! all, the function's output is returned to the client verbatim.

use http::{Request, Response};

use crate::body::ProxyBody;
use crate::error::HandlerError;
use crate::prepare::HandlerOptions;

pub async fn respond(options: &HandlerOptions, req: &Request<ProxyBody>) -> Result<Response<ProxyBody>, HandlerError> {
	let function = options
		.custom_response_function
		.as_ref()
		.expect("custom_response handler requires a custom_response_function");

	function(req.method().clone(), req.uri().clone(), req.headers().clone())
		.await
		.map_err(HandlerError::Other)
}
