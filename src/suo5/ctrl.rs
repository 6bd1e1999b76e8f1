//! Duplex-mode probing.
//!
//! The probe streams a random payload in the request body and force-closes
//! the body after ~3 s. A server (and path) capable of full duplex echoes
//! the payload back while the request is still open, so the first response
//! bytes arrive well inside the 3 s window; buffering middleware holds the
//! response until the request completes, which lands it past the mark.
//! The echo's position inside the response is the server prelude offset
//! that every later exchange must skip.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::http1 as web;

use super::{DuplexMode, Suo5Dialer};

/// The mode rides in the content type: probe, full-duplex exchange, or
/// half-duplex read/write legs.
pub(super) const MODE_HEADER: &str = "Content-Type";
pub(super) const MODE_CHECKING: &str = "application/plain";
pub(super) const MODE_FULL: &str = "application/octet-stream";
pub(super) const MODE_HALF: &str = "application/x-www-form-urlencoded";

const PROBE_WINDOW: Duration = Duration::from_secs(3);
const PROBE_DEADLINE: Duration = Duration::from_secs(8);

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub(super) fn rand_string(n: usize) -> String {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
        .collect()
}

pub(super) async fn check_connect_mode(dialer: &Suo5Dialer) -> Result<(DuplexMode, usize)> {
    let payload_len = {
        let mut n = rand::rng().random_range(0..1024);
        if n <= 32 {
            n += 32;
        }
        n
    };
    let probe = rand_string(payload_len);

    let (tx, body) = web::channel_body();
    let _ = tx.send(Bytes::from(probe.clone().into_bytes()));
    // The writer closes after the window regardless of progress.
    let closer = tokio::spawn(async move {
        tokio::time::sleep(PROBE_WINDOW).await;
        drop(tx);
    });

    let mut sender = web::open::<web::ChannelBody>(&dialer.target, &dialer.upstream).await?;
    let mut builder = web::post_builder(&dialer.target).header(MODE_HEADER, MODE_CHECKING);
    if let Some(cookie) = dialer.jar.header() {
        builder = builder.header(hyper::header::COOKIE, cookie);
    }
    let request = builder
        .body(body)
        .map_err(|e| ProxyError::Protocol(e.to_string()))?;

    let started = Instant::now();
    let collect = async {
        let response = sender.send_request(request).await?;
        dialer.jar.store(response.headers());
        let mut reader = web::BodyReader::new(response.into_body());
        let mut collected = Vec::new();
        let mut first_bytes: Option<Duration> = None;
        while let Some(chunk) = reader.chunk().await {
            match chunk {
                Ok(chunk) => {
                    if first_bytes.is_none() && !chunk.is_empty() {
                        first_bytes = Some(started.elapsed());
                    }
                    collected.extend_from_slice(&chunk);
                }
                Err(e) => {
                    // An early EOF can still leave a usable echo behind.
                    warn!(error = %e, "probe response ended abnormally");
                    break;
                }
            }
        }
        Ok::<_, ProxyError>((collected, first_bytes))
    };

    let result = tokio::time::timeout(PROBE_DEADLINE, collect).await;
    closer.abort();
    let (collected, first_bytes) = result
        .map_err(|_| ProxyError::Handshake("duplex probe timed out".into()))??;

    let needle = &probe.as_bytes()[..32];
    let offset = find_subsequence(&collected, needle)
        .ok_or_else(|| ProxyError::Handshake("remote server check failed".into()))?;

    let elapsed = first_bytes.unwrap_or_else(|| started.elapsed());
    let mode = if elapsed < PROBE_WINDOW {
        DuplexMode::Full
    } else {
        DuplexMode::Half
    };
    debug!(?mode, offset, elapsed_ms = elapsed.as_millis() as u64, "duplex probe finished");
    Ok((mode, offset))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
