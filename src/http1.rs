//! HTTP/1.1 plumbing shared by the neoreg and suo5 transports.
//!
//! Both tunnels must issue requests *through the configured upstream
//! dialer*, so a pooled general-purpose client is useless here. Instead
//! each exchange runs on a hyper client-conn handshake over a stream the
//! upstream produced, optionally TLS-wrapped. Client-conn also gives the
//! streaming-body semantics suo5's full-duplex mode depends on: the
//! request body can keep flowing while the response body is being read.

use std::convert::Infallible;
use std::io::Read;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, Incoming};
use hyper::client::conn::http1 as conn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::client::DynDialer;
use crate::error::{ProxyError, Result};
use crate::tls::wrap_tls;

/// Browser-like User-Agent sent on tunnel requests.
pub(crate) const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Where the tunnel endpoint lives, parsed once from the proxy URL.
#[derive(Debug, Clone)]
pub(crate) struct HttpTarget {
    pub tls: bool,
    /// Hostname for SNI.
    pub host: String,
    /// `host:port` dialed on the upstream.
    pub authority: String,
    /// Value of the `Host` header (port elided when default).
    pub host_header: String,
    /// Origin-form request target (path plus query).
    pub path: String,
}

impl HttpTarget {
    pub fn from_url(proxy: &Url, tls: bool) -> Result<Self> {
        let host = proxy
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUrl("missing host".into()))?
            .to_owned();
        let default_port = if tls { 443 } else { 80 };
        let port = proxy.port().unwrap_or(default_port);
        // Tunnel parameters live in the query string and are consumed by
        // the factory; only the path reaches the remote endpoint.
        let mut path = match proxy.path() {
            "" => "/".to_owned(),
            p => p.to_owned(),
        };
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        let host_header = if port == default_port {
            host.clone()
        } else {
            format!("{host}:{port}")
        };
        Ok(Self {
            tls,
            authority: format!("{host}:{port}"),
            host,
            host_header,
            path,
        })
    }
}

/// Dial the target through `upstream`, wrap TLS when required and run the
/// http1 handshake. The connection driver is detached; the returned
/// handle lives until the connection errors or is dropped.
pub(crate) async fn open<B>(target: &HttpTarget, upstream: &DynDialer) -> Result<conn::SendRequest<B>>
where
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let stream = upstream.dial("tcp", &target.authority).await?;
    let stream = if target.tls {
        wrap_tls(stream, &target.host).await?
    } else {
        stream
    };

    let (sender, connection) = conn::Builder::new()
        .handshake::<_, B>(TokioIo::new(stream))
        .await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "http tunnel connection ended");
        }
    });
    Ok(sender)
}

/// POST request builder with the headers every tunnel request carries.
pub(crate) fn post_builder(target: &HttpTarget) -> hyper::http::request::Builder {
    Request::builder()
        .method(hyper::Method::POST)
        .uri(target.path.clone())
        .header(hyper::header::HOST, target.host_header.clone())
        .header(hyper::header::USER_AGENT, BROWSER_UA)
        .header(hyper::header::CONNECTION, "keep-alive")
}

/// Collect a response body, undoing `Content-Encoding: gzip`/`deflate`.
pub(crate) async fn read_body(resp: Response<Incoming>) -> Result<Vec<u8>> {
    use http_body_util::BodyExt;

    let encoding = resp
        .headers()
        .get(hyper::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let raw = resp.into_body().collect().await?.to_bytes();

    match encoding.as_str() {
        "gzip" => {
            let mut out = Vec::with_capacity(raw.len() * 2);
            flate2::read::GzDecoder::new(&raw[..]).read_to_end(&mut out)?;
            Ok(out)
        }
        "deflate" => {
            let mut out = Vec::with_capacity(raw.len() * 2);
            flate2::read::ZlibDecoder::new(&raw[..]).read_to_end(&mut out)?;
            Ok(out)
        }
        _ => Ok(raw.to_vec()),
    }
}

// ── One-shot POST client ─────────────────────────────────────────────

pub(crate) struct CollectedResponse {
    pub status: hyper::StatusCode,
    pub headers: hyper::HeaderMap,
    pub body: Vec<u8>,
}

/// Request/response POSTs over a cached connection, re-dialed through
/// the upstream when the old one has gone away. Calls are serialized by
/// the sender lock, which is what http1 requires anyway.
pub(crate) struct PostClient {
    target: HttpTarget,
    upstream: DynDialer,
    timeout: Option<std::time::Duration>,
    sender: tokio::sync::Mutex<Option<conn::SendRequest<http_body_util::Full<Bytes>>>>,
}

impl PostClient {
    pub fn new(target: HttpTarget, upstream: DynDialer, timeout: Option<std::time::Duration>) -> Self {
        Self {
            target,
            upstream,
            timeout,
            sender: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn post<F>(&self, customize: F, body: Bytes) -> Result<CollectedResponse>
    where
        F: FnOnce(hyper::http::request::Builder) -> hyper::http::request::Builder,
    {
        let mut guard = self.sender.lock().await;
        let needs_dial = match guard.as_mut() {
            Some(sender) => sender.ready().await.is_err(),
            None => true,
        };
        if needs_dial {
            *guard = Some(open(&self.target, &self.upstream).await?);
        }
        let sender = guard.as_mut().expect("sender just ensured");

        let exchange = async {
            let request = customize(post_builder(&self.target))
                .body(http_body_util::Full::new(body))
                .map_err(|e| ProxyError::Protocol(e.to_string()))?;
            let response = sender.send_request(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = read_body(response).await?;
            Ok(CollectedResponse {
                status,
                headers,
                body,
            })
        };
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(result) => result,
                Err(_) => {
                    *guard = None;
                    return Err(ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "tunnel request timed out",
                    )));
                }
            },
            None => exchange.await,
        };
        if outcome.is_err() {
            // The connection state is unknown after a failed exchange.
            *guard = None;
        }
        outcome
    }
}

// ── Streaming request body ───────────────────────────────────────────

/// Request body fed through a channel; closing the sender ends the body
/// (and with it the request).
pub(crate) struct ChannelBody {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

pub(crate) fn channel_body() -> (mpsc::UnboundedSender<Bytes>, ChannelBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, ChannelBody { rx })
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, Infallible>>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ── Streaming response body ──────────────────────────────────────────

/// Poll-based data-chunk reader over a streaming response body.
pub(crate) struct BodyReader {
    body: Incoming,
    done: bool,
}

impl BodyReader {
    pub fn new(body: Incoming) -> Self {
        Self { body, done: false }
    }

    /// Next data chunk; `None` once the body is finished. Non-data frames
    /// (trailers) are skipped.
    pub fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<std::io::Result<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut self.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return Poll::Ready(Some(Ok(data)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(std::io::Error::other(e))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    pub async fn chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        std::future::poll_fn(|cx| self.poll_chunk(cx)).await
    }
}
