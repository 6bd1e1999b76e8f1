//! Neoreg session: handshake, read pump, and the virtual stream.
//!
//! One background task owns the READ poll loop and is the only writer to
//! the buffer tail; the stream's `poll_read` is the only consumer moving
//! the head cursor. They meet over a single stored waker, which makes the
//! wakeup edge-triggered and idempotent. Streaming errors latch onto the
//! session and resurface from every later read.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace, warn};

use crate::client::{DynDialer, split_host_port};
use crate::error::{ProxyError, Result};
use crate::http1::{self as web, HttpTarget};

use super::NeoregConfig;
use super::codec::{self, Envelope, tag};
use super::keygen::KeyMaterial;

// ── HTTP side ────────────────────────────────────────────────────────

/// Issues one encoded POST per command over a cached http1 connection,
/// re-dialed through the upstream when it goes away.
struct Tunnel {
    client: web::PostClient,
    material: Arc<KeyMaterial>,
}

impl Tunnel {
    async fn roundtrip(&self, info: &Envelope) -> Result<Envelope> {
        let body = Bytes::from(codec::encode_body(info, &self.material));
        let response = self
            .client
            .post(
                |builder| {
                    builder
                        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
                        .header(hyper::header::ACCEPT_ENCODING, "gzip, deflate")
                },
                body,
            )
            .await?;
        if !response.status.is_success() {
            return Err(ProxyError::Protocol(format!(
                "unexpected http status {}",
                response.status
            )));
        }
        Ok(codec::decode_body(&response.body, &self.material))
    }
}

fn status_ok(info: &Envelope) -> bool {
    info.get(&tag::STATUS).is_some_and(|s| s == b"OK")
}

fn random_mask() -> Vec<u8> {
    let raw: [u8; 4] = rand::rng().random();
    hex::encode(raw).into_bytes()
}

// ── Shared read state ────────────────────────────────────────────────

struct ReadState {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    /// Latched streaming error, reported from every read after close.
    err: Option<String>,
    /// The pump is gone; no more data will arrive.
    read_closed: bool,
    /// Close() was called locally; tells the pump to stop polling.
    local_closed: bool,
    waker: Option<Waker>,
}

impl ReadState {
    fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity.max(1)],
            start: 0,
            end: 0,
            err: None,
            read_closed: false,
            local_closed: false,
            waker: None,
        }
    }

    /// Append incoming bytes. Grows (never shrinks) when the chunk cannot
    /// fit, compacts to the front when only the tail is short.
    fn push(&mut self, data: &[u8]) {
        let unread = self.end - self.start;
        if unread + data.len() > self.buf.len() {
            // Twice what is needed right now; with an empty backlog this
            // is exactly 2×len(data).
            let mut grown = vec![0u8; 2 * (unread + data.len())];
            grown[..unread].copy_from_slice(&self.buf[self.start..self.end]);
            self.buf = grown;
            self.start = 0;
            self.end = unread;
        } else if self.buf.len() - self.end < data.len() {
            self.buf.copy_within(self.start..self.end, 0);
            self.start = 0;
            self.end = unread;
        }
        self.buf[self.end..self.end + data.len()].copy_from_slice(data);
        self.end += data.len();
    }

    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn close_with(&mut self, err: Option<String>) {
        if self.err.is_none() {
            self.err = err;
        }
        self.read_closed = true;
        self.wake();
    }
}

// ── Read pump ────────────────────────────────────────────────────────

async fn run_pump(tunnel: Arc<Tunnel>, state: Arc<Mutex<ReadState>>, mask: Vec<u8>, interval: Duration) {
    let poll = Envelope::from([
        (tag::COMMAND, b"READ".to_vec()),
        (tag::MARK, mask),
    ]);

    loop {
        if state.lock().local_closed {
            break;
        }
        match tunnel.roundtrip(&poll).await {
            Ok(response) if status_ok(&response) => {
                match response.get(&tag::DATA) {
                    Some(data) if !data.is_empty() => {
                        trace!(len = data.len(), "pump received data");
                        let mut st = state.lock();
                        st.push(data);
                        st.wake();
                    }
                    _ => tokio::time::sleep(interval).await,
                }
            }
            Ok(response) => {
                let detail = response
                    .get(&tag::ERROR)
                    .map(|e| String::from_utf8_lossy(e).into_owned());
                debug!(error = ?detail, "pump stopped by server status");
                state.lock().close_with(Some(detail.unwrap_or_else(|| "read failed".into())));
                break;
            }
            Err(e) => {
                debug!(error = %e, "pump stopped by transport error");
                state.lock().close_with(Some(e.to_string()));
                break;
            }
        }
    }
}

// ── Session setup ────────────────────────────────────────────────────

pub(super) async fn open_session(
    target: &HttpTarget,
    material: Arc<KeyMaterial>,
    config: &NeoregConfig,
    upstream: DynDialer,
    address: &str,
) -> Result<NeoregStream> {
    let (host, port) = split_host_port(address)?;
    let mask = random_mask();

    let tunnel = Arc::new(Tunnel {
        client: web::PostClient::new(target.clone(), upstream, Some(config.timeout)),
        material,
    });

    let connect = Envelope::from([
        (tag::COMMAND, b"CONNECT".to_vec()),
        (tag::MARK, mask.clone()),
        (tag::IP, host.into_bytes()),
        (tag::PORT, port.to_string().into_bytes()),
    ]);

    // Bounded retries with linearly growing backoff; a decoded non-OK
    // status means the server refused the target and is final.
    let mut connected = false;
    for attempt in 1..=config.max_retry.max(1) {
        match tunnel.roundtrip(&connect).await {
            Ok(response) if status_ok(&response) => {
                connected = true;
                break;
            }
            Ok(_) => break,
            Err(e) => {
                warn!(attempt, error = %e, "neoreg connect attempt failed");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
        }
    }
    if !connected {
        return Err(ProxyError::ConnectFailed);
    }
    debug!(mask = %String::from_utf8_lossy(&mask), "neoreg session established");

    let state = Arc::new(Mutex::new(ReadState::new(config.buffer_size)));
    let pump = tokio::spawn(run_pump(
        tunnel.clone(),
        state.clone(),
        mask.clone(),
        config.interval,
    ));

    Ok(NeoregStream {
        tunnel,
        state,
        mask,
        write: WriteOp::Idle,
        closed: Arc::new(AtomicBool::new(false)),
        pump,
    })
}

// ── The virtual stream ───────────────────────────────────────────────

type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

enum WriteOp {
    Idle,
    Busy(WriteFuture),
}

pub struct NeoregStream {
    tunnel: Arc<Tunnel>,
    state: Arc<Mutex<ReadState>>,
    mask: Vec<u8>,
    write: WriteOp,
    closed: Arc<AtomicBool>,
    pump: tokio::task::JoinHandle<()>,
}

async fn forward(tunnel: Arc<Tunnel>, mask: Vec<u8>, data: Bytes) -> io::Result<usize> {
    let len = data.len();
    let info = Envelope::from([
        (tag::COMMAND, b"FORWARD".to_vec()),
        (tag::MARK, mask),
        (tag::DATA, data.to_vec()),
    ]);
    let response = tunnel.roundtrip(&info).await.map_err(io::Error::from)?;
    if status_ok(&response) {
        Ok(len)
    } else {
        Err(io::Error::other(ProxyError::WriteFailed))
    }
}

impl NeoregStream {
    /// Idempotent: the first close stops the pump, wakes any blocked
    /// read and fires one best-effort DISCONNECT.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut st = self.state.lock();
            st.local_closed = true;
            st.close_with(None);
        }
        self.pump.abort();

        let tunnel = self.tunnel.clone();
        let info = Envelope::from([
            (tag::COMMAND, b"DISCONNECT".to_vec()),
            (tag::MARK, self.mask.clone()),
        ]);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                // Servers that fail DISCONNECT do not surface an error.
                let _ = tunnel.roundtrip(&info).await;
            });
        }
    }
}

impl AsyncRead for NeoregStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut st = self.state.lock();
        if st.start < st.end {
            let n = buf.remaining().min(st.end - st.start);
            buf.put_slice(&st.buf[st.start..st.start + n]);
            st.start += n;
            if st.start == st.end {
                st.start = 0;
                st.end = 0;
            }
            return Poll::Ready(Ok(()));
        }
        if st.read_closed {
            return match &st.err {
                Some(msg) => Poll::Ready(Err(io::Error::other(msg.clone()))),
                None => Poll::Ready(Ok(())), // clean end-of-stream
            };
        }
        st.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for NeoregStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.write, WriteOp::Idle) {
                WriteOp::Idle => {
                    if this.closed.load(Ordering::SeqCst) {
                        return Poll::Ready(Err(io::Error::other(ProxyError::Closed)));
                    }
                    // If the previous call returned Pending, the contract
                    // says the caller re-submits the same buf; the copy
                    // stored in the in-flight future is what gets sent.
                    let fut = forward(
                        this.tunnel.clone(),
                        this.mask.clone(),
                        Bytes::copy_from_slice(buf),
                    );
                    this.write = WriteOp::Busy(Box::pin(fut));
                }
                WriteOp::Busy(mut fut) => {
                    return match fut.as_mut().poll(cx) {
                        Poll::Ready(result) => Poll::Ready(result),
                        Poll::Pending => {
                            this.write = WriteOp::Busy(fut);
                            Poll::Pending
                        }
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Each write is a complete HTTP exchange; nothing is buffered.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for NeoregStream {
    fn drop(&mut self) {
        self.close();
    }
}
