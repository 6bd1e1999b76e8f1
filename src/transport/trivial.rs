//! Direct, reject and blackhole transports.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use url::Url;

use crate::client::{Dialer, DynDialer};
use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;

pub fn new_direct(_proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    Ok(Arc::new(DirectDialer { upstream }))
}

pub fn new_reject(_proxy: &Url, _upstream: DynDialer) -> Result<DynDialer> {
    Ok(Arc::new(RejectDialer))
}

pub fn new_blackhole(_proxy: &Url, _upstream: DynDialer) -> Result<DynDialer> {
    Ok(Arc::new(BlackholeDialer))
}

/// Calls the upstream verbatim.
struct DirectDialer {
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        self.upstream.dial(network, address).await
    }
}

struct RejectDialer;

#[async_trait]
impl Dialer for RejectDialer {
    async fn dial(&self, _network: &str, _address: &str) -> Result<ProxyStream> {
        Err(ProxyError::Rejected)
    }
}

struct BlackholeDialer;

#[async_trait]
impl Dialer for BlackholeDialer {
    async fn dial(&self, _network: &str, _address: &str) -> Result<ProxyStream> {
        Ok(Box::new(BlackholeStream::default()))
    }
}

/// Swallows writes; reads pend until the stream is closed locally, then
/// report end-of-stream.
#[derive(Default)]
struct BlackholeStream {
    state: Mutex<BlackholeState>,
}

#[derive(Default)]
struct BlackholeState {
    closed: bool,
    waker: Option<Waker>,
}

impl AsyncRead for BlackholeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut state = self.state.lock();
        if state.closed {
            return Poll::Ready(Ok(()));
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for BlackholeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut state = self.state.lock();
        state.closed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn reject_always_fails() {
        let dialer = new_reject(&url("reject://"), crate::client::system_dialer()).unwrap();
        assert!(matches!(
            dialer.dial("tcp", "127.0.0.1:1").await,
            Err(ProxyError::Rejected)
        ));
    }

    #[tokio::test]
    async fn blackhole_swallows_writes_and_blocks_reads() {
        let dialer = new_blackhole(&url("blackhole://"), crate::client::system_dialer()).unwrap();
        let mut stream = dialer.dial("tcp", "example.com:80").await.unwrap();

        stream.write_all(b"into the void").await.unwrap();

        let mut buf = [0u8; 8];
        // Nothing to read until the stream is closed.
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), stream.read(&mut buf)).await;
        assert!(pending.is_err());

        stream.shutdown().await.unwrap();
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
