//! Suo5 sessions: connect handshake, the full/half-duplex streams and
//! the heartbeat task.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::client::split_host_port;
use crate::error::{ProxyError, Result};
use crate::http1 as web;
use crate::stream::ProxyStream;

use super::ctrl::{MODE_FULL, MODE_HALF, MODE_HEADER};
use super::frame::{self, ActionMap};
use super::{CookieJar, DuplexMode, Suo5Dialer};

pub(super) async fn open_session(
    dialer: &Suo5Dialer,
    mode: DuplexMode,
    offset: usize,
    address: &str,
) -> Result<ProxyStream> {
    let (host, port) = split_host_port(address)?;
    let id = super::ctrl::rand_string(8);
    let create = frame::new_create(&id, &host, port, dialer.config.redirect_url.as_deref());
    let create_bytes = Bytes::from(frame::marshal(&create));

    let (reader, writer) = match mode {
        DuplexMode::Full => {
            // One live exchange: the request body channel stays open for
            // the session's writes, the response body carries its reads.
            let (tx, body) = web::channel_body();
            let _ = tx.send(create_bytes);

            let mut sender = web::open::<web::ChannelBody>(&dialer.target, &dialer.upstream).await?;
            let mut builder = web::post_builder(&dialer.target).header(MODE_HEADER, MODE_FULL);
            if let Some(cookie) = dialer.jar.header() {
                builder = builder.header(hyper::header::COOKIE, cookie);
            }
            let request = builder
                .body(body)
                .map_err(|e| ProxyError::Protocol(e.to_string()))?;
            let response = tokio::time::timeout(dialer.config.timeout, sender.send_request(request))
                .await
                .map_err(|_| ProxyError::Handshake("timed out waiting for response".into()))??;
            if !response.status().is_success() {
                return Err(ProxyError::Handshake(format!(
                    "unexpected http status {}",
                    response.status()
                )));
            }
            dialer.jar.store(response.headers());

            let reader = FrameReader::new(web::BodyReader::new(response.into_body()), offset);
            (reader, Writer::Full { tx: Some(tx) })
        }
        DuplexMode::Half => {
            // The Create POST's response body is the session's read leg;
            // writes go out as separate short POSTs.
            let mut sender =
                web::open::<http_body_util::Full<Bytes>>(&dialer.target, &dialer.upstream).await?;
            let mut builder = web::post_builder(&dialer.target).header(MODE_HEADER, MODE_HALF);
            if let Some(cookie) = dialer.jar.header() {
                builder = builder.header(hyper::header::COOKIE, cookie);
            }
            let request = builder
                .body(http_body_util::Full::new(create_bytes))
                .map_err(|e| ProxyError::Protocol(e.to_string()))?;
            let response = tokio::time::timeout(dialer.config.timeout, sender.send_request(request))
                .await
                .map_err(|_| ProxyError::Handshake("timed out waiting for response".into()))??;
            if !response.status().is_success() {
                return Err(ProxyError::Handshake(format!(
                    "unexpected http status {}",
                    response.status()
                )));
            }
            dialer.jar.store(response.headers());

            let reader = FrameReader::new(web::BodyReader::new(response.into_body()), offset);
            let post = Arc::new(web::PostClient::new(
                dialer.target.clone(),
                dialer.upstream.clone(),
                Some(dialer.config.timeout),
            ));
            (
                reader,
                Writer::Half(HalfWriter {
                    post,
                    jar: dialer.jar.clone(),
                    id: id.clone(),
                    op: None,
                }),
            )
        }
    };

    let mut stream = Suo5Stream {
        reader,
        writer,
        id: id.clone(),
        closed: false,
        remote_closed: false,
        heartbeat: None,
    };

    // The first frame is the create status; exactly one 0x00 byte.
    let first = tokio::time::timeout(dialer.config.timeout, stream.reader.next_action())
        .await
        .map_err(|_| ProxyError::Handshake("timed out waiting for status".into()))?
        .map_err(ProxyError::Io)?;
    let ok = first
        .as_ref()
        .and_then(|map| map.get(frame::key::STATUS))
        .is_some_and(|status| matches!(status.as_slice(), [0x00]));
    if !ok {
        return Err(ProxyError::Handshake("failed to dial".into()));
    }
    debug!(id = %id, ?mode, "suo5 session established");

    if dialer.config.enable_heartbeat {
        stream.heartbeat = Some(spawn_heartbeat(
            &stream.writer,
            id,
            dialer.config.heartbeat_interval,
        ));
    }
    Ok(Box::new(stream))
}

// ── Frame reader ─────────────────────────────────────────────────────

/// Reassembles action frames out of a streaming response body, skipping
/// the server's prelude bytes first.
struct FrameReader {
    body: web::BodyReader,
    skip: usize,
    acc: BytesMut,
    current: Bytes,
    eof: bool,
}

impl FrameReader {
    fn new(body: web::BodyReader, skip: usize) -> Self {
        Self {
            body,
            skip,
            acc: BytesMut::new(),
            current: Bytes::new(),
            eof: false,
        }
    }

    fn poll_action(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<ActionMap>>> {
        loop {
            match frame::try_parse(&mut self.acc) {
                Ok(Some(map)) => return Poll::Ready(Ok(Some(map))),
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(io::Error::other(e))),
            }
            if self.eof {
                return Poll::Ready(Ok(None));
            }
            match self.body.poll_chunk(cx) {
                Poll::Ready(Some(Ok(mut chunk))) => {
                    if self.skip > 0 {
                        let n = self.skip.min(chunk.len());
                        chunk.advance(n);
                        self.skip -= n;
                    }
                    if !chunk.is_empty() {
                        self.acc.extend_from_slice(&chunk);
                    }
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => self.eof = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    async fn next_action(&mut self) -> io::Result<Option<ActionMap>> {
        std::future::poll_fn(|cx| self.poll_action(cx)).await
    }
}

// ── Write side ───────────────────────────────────────────────────────

type WriteFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

enum Writer {
    /// Frames go into the live request body; `None` once closed.
    Full { tx: Option<mpsc::UnboundedSender<Bytes>> },
    /// One short POST per write.
    Half(HalfWriter),
}

struct HalfWriter {
    post: Arc<web::PostClient>,
    jar: Arc<CookieJar>,
    id: String,
    op: Option<WriteFuture>,
}

async fn half_post(
    post: Arc<web::PostClient>,
    jar: Arc<CookieJar>,
    map: ActionMap,
    len: usize,
) -> io::Result<usize> {
    let body = Bytes::from(frame::marshal(&map));
    let response = post
        .post(
            |mut builder| {
                builder = builder.header(MODE_HEADER, MODE_HALF);
                if let Some(cookie) = jar.header() {
                    builder = builder.header(hyper::header::COOKIE, cookie);
                }
                builder
            },
            body,
        )
        .await
        .map_err(io::Error::from)?;
    if !response.status.is_success() {
        return Err(io::Error::other(ProxyError::WriteFailed));
    }
    jar.store(&response.headers);
    Ok(len)
}

// ── Heartbeat ────────────────────────────────────────────────────────

/// Periodic keep-alive; its own write errors are dropped. Aborted when
/// the session closes.
fn spawn_heartbeat(writer: &Writer, id: String, interval: Duration) -> tokio::task::JoinHandle<()> {
    match writer {
        Writer::Full { tx: Some(tx) } => {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let beat = Bytes::from(frame::marshal(&frame::new_heartbeat(&id)));
                    if tx.send(beat).is_err() {
                        break;
                    }
                    trace!(id = %id, "heartbeat sent");
                }
            })
        }
        Writer::Half(half) => {
            let post = half.post.clone();
            let jar = half.jar.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let _ = half_post(post.clone(), jar.clone(), frame::new_heartbeat(&id), 0).await;
                    trace!(id = %id, "heartbeat sent");
                }
            })
        }
        Writer::Full { tx: None } => tokio::spawn(async {}),
    }
}

// ── The stream ───────────────────────────────────────────────────────

struct Suo5Stream {
    reader: FrameReader,
    writer: Writer,
    id: String,
    closed: bool,
    remote_closed: bool,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

impl Suo5Stream {
    /// Idempotent: first close stops the heartbeat, sends a best-effort
    /// Delete and ends the write leg.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        match &mut self.writer {
            Writer::Full { tx } => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Bytes::from(frame::marshal(&frame::new_delete(&self.id))));
                    // Dropping the sender ends the request body and with
                    // it the exchange.
                }
            }
            Writer::Half(half) => {
                let post = half.post.clone();
                let jar = half.jar.clone();
                let id = self.id.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = half_post(post, jar, frame::new_delete(&id), 0).await;
                    });
                }
            }
        }
    }
}

impl AsyncRead for Suo5Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.reader.current.is_empty() {
                let n = buf.remaining().min(this.reader.current.len());
                buf.put_slice(&this.reader.current.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.remote_closed {
                return Poll::Ready(Ok(()));
            }
            match this.reader.poll_action(cx) {
                Poll::Ready(Ok(Some(mut map))) => match frame::action_of(&map) {
                    Some(frame::action::DATA) => {
                        if let Some(data) = map.remove(frame::key::DATA) {
                            this.reader.current = Bytes::from(data);
                        }
                    }
                    Some(frame::action::DELETE) => {
                        trace!(id = %this.id, "server deleted session");
                        this.remote_closed = true;
                    }
                    // Heartbeats and unknown actions carry no stream data.
                    _ => {}
                },
                Poll::Ready(Ok(None)) => {
                    this.remote_closed = true;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for Suo5Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::other(ProxyError::Closed)));
        }
        match &mut this.writer {
            Writer::Full { tx } => {
                let Some(tx) = tx.as_ref() else {
                    return Poll::Ready(Err(io::Error::other(ProxyError::Closed)));
                };
                let data = Bytes::from(frame::marshal(&frame::new_data(&this.id, buf)));
                tx.send(data).map_err(|_| {
                    io::Error::new(io::ErrorKind::BrokenPipe, "request body closed")
                })?;
                Poll::Ready(Ok(buf.len()))
            }
            Writer::Half(half) => loop {
                match half.op.take() {
                    None => {
                        let fut = half_post(
                            half.post.clone(),
                            half.jar.clone(),
                            frame::new_data(&half.id, buf),
                            buf.len(),
                        );
                        half.op = Some(Box::pin(fut));
                    }
                    Some(mut fut) => {
                        return match fut.as_mut().poll(cx) {
                            Poll::Ready(result) => Poll::Ready(result),
                            Poll::Pending => {
                                half.op = Some(fut);
                                Poll::Pending
                            }
                        };
                    }
                }
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for Suo5Stream {
    fn drop(&mut self) {
        self.close();
    }
}
