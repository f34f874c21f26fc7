//! Bidirectional byte relay shared by every handler that splices a client socket to a
//! target socket.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

// A reset from either peer mid-stream is not an error; TCP connections close
// ungracefully all the time.
pub async fn relay<A, B>(mut a: A, mut b: B) -> Result<(), RelayError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let res = tokio::io::copy_bidirectional(&mut a, &mut b).await;
	let _ = a.shutdown().await;
	let _ = b.shutdown().await;
	match res {
		Ok(_) => Ok(()),
		Err(e) if is_peer_gone(&e) => Ok(()),
		Err(e) => Err(e.into()),
	}
}

fn is_peer_gone(e: &std::io::Error) -> bool {
	use std::io::ErrorKind::*;
	matches!(
		e.kind(),
		NotConnected | ConnectionReset | BrokenPipe | UnexpectedEof | WriteZero
	)
}
