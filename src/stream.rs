//! The byte-stream contract returned by every dialer.

use tokio::io::{AsyncRead, AsyncWrite};

/// Minimal bidirectional byte channel: read, write, close (via shutdown
/// or drop). Transports with no real address or deadline semantics simply
/// do not expose any.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

pub type ProxyStream = Box<dyn Stream>;
