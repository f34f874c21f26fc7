//! Common response body type shared by the handlers and custom-response path. Both
//! "I have a fixed buffer" (custom responses, error bodies) and "I'm streaming an
//! upstream's `hyper::body::Incoming`" need to show up as the same type to the
//! Dispatcher, so everything is boxed into one `BoxBody`.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
	Full::new(bytes.into())
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

pub fn empty_body() -> ProxyBody {
	Empty::new()
		.map_err(|never: std::convert::Infallible| match never {})
		.boxed()
}

pub fn box_body<B>(body: B) -> ProxyBody
where
	B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
	B::Error: std::error::Error + Send + Sync + 'static,
{
	body.map_err(|e| Box::new(e) as BoxError).boxed()
}
