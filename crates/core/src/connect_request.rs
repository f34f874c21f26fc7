//! Hand-parses a `CONNECT` request line and headers straight off the socket. By the
//! time we get here, [`crate::sniff::sniff_method`] has already consumed the literal
//! bytes `"CONNECT "`, so parsing resumes from there rather than from byte zero.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RequestError;

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

pub struct ConnectRequest {
	pub authority: String,
	pub headers: HeaderMap,
}

pub async fn read<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(ConnectRequest, Bytes), RequestError> {
	let mut head = b"CONNECT ".to_vec();
	let mut byte = [0u8; 1];
	loop {
		if head.len() >= MAX_HEAD_BYTES {
			return Err(RequestError::bad_request("CONNECT request headers exceeded the size limit"));
		}
		let n = stream
			.read(&mut byte)
			.await
			.map_err(|_| RequestError::bad_request("CONNECT request could not be read"))?;
		if n == 0 {
			return Err(RequestError::bad_request("CONNECT request could not be parsed"));
		}
		head.push(byte[0]);
		if head.ends_with(b"\r\n\r\n") {
			break;
		}
	}

	let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
	let mut parsed = httparse::Request::new(&mut raw_headers);
	let status = parsed
		.parse(&head)
		.map_err(|_| RequestError::bad_request("CONNECT request could not be parsed"))?;
	if status.is_partial() {
		return Err(RequestError::bad_request("CONNECT request could not be parsed"));
	}

	let authority = parsed
		.path
		.ok_or_else(|| RequestError::bad_request("CONNECT request could not be parsed"))?
		.to_string();

	let mut headers = HeaderMap::new();
	for header in parsed.headers.iter() {
		if header.name.is_empty() {
			continue;
		}
		let name = HeaderName::from_bytes(header.name.as_bytes())
			.map_err(|_| RequestError::bad_request("CONNECT request headers could not be parsed"))?;
		let value = HeaderValue::from_bytes(header.value)
			.map_err(|_| RequestError::bad_request("CONNECT request headers could not be parsed"))?;
		headers.append(name, value);
	}

	Ok((ConnectRequest { authority, headers }, Bytes::new()))
}

pub fn authority_uri(authority: &str) -> Result<Uri, RequestError> {
	Uri::builder()
		.authority(authority)
		.build()
		.map_err(|_| RequestError::bad_request(format!("Target \"{authority}\" could not be parsed")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn parses_request_line_and_headers() {
		let mut cursor = std::io::Cursor::new(
			b"secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n".to_vec(),
		);
		let (req, _) = read(&mut cursor).await.unwrap();
		assert_eq!(req.authority, "secure.test:443");
		assert_eq!(req.headers.get("host").unwrap(), "secure.test:443");
		assert!(req.headers.get("proxy-authorization").is_some());
	}

	#[tokio::test]
	async fn truncated_request_is_a_parse_error() {
		let mut cursor = std::io::Cursor::new(b"secure.test:443 HTTP/1.1\r\n".to_vec());
		let err = read(&mut cursor).await.unwrap_err();
		assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
	}
}
