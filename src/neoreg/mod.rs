//! Neoreg transport: a byte stream tunneled through stateless HTTP POSTs.
//!
//! The server side is a small script planted in a foreign web host; it
//! cannot keep a socket open across requests, so the client converts the
//! request/response command loop (CONNECT / FORWARD / READ / DISCONNECT)
//! into a stream with a background read pump. Payloads travel inside a
//! key-encoded envelope, see [`codec`].

pub mod mt19937;

pub mod codec;
mod conn;
mod keygen;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::client::{self, Dialer, DynDialer};
use crate::error::{ProxyError, Result};
use crate::http1::HttpTarget;
use crate::stream::ProxyStream;

pub use keygen::KeyMaterial;

/// Tunable session parameters, overridable per URL query string.
#[derive(Debug, Clone)]
pub struct NeoregConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// CONNECT attempts before giving up.
    pub max_retry: u32,
    /// Sleep between empty READ polls.
    pub interval: Duration,
    /// Initial read-buffer capacity; grows on demand, never shrinks.
    pub buffer_size: usize,
}

impl Default for NeoregConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retry: 10,
            interval: Duration::from_millis(100),
            buffer_size: 64 * 1024,
        }
    }
}

impl NeoregConfig {
    fn from_query(proxy: &Url) -> Result<Self> {
        let mut config = Self::default();
        for (name, value) in proxy.query_pairs() {
            match name.as_ref() {
                "timeout" => config.timeout = parse_duration(&value)?,
                "interval" => config.interval = parse_duration(&value)?,
                "retry" => {
                    config.max_retry = value
                        .parse()
                        .map_err(|_| ProxyError::InvalidUrl(format!("bad retry: {value}")))?
                }
                "buffer_size" => {
                    config.buffer_size = value
                        .parse()
                        .map_err(|_| ProxyError::InvalidUrl(format!("bad buffer_size: {value}")))?
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

/// `"500ms"`, `"5s"`, `"2m"`, or a bare integer meaning seconds.
fn parse_duration(s: &str) -> Result<Duration> {
    let parse = |num: &str, mul: u64| -> Result<Duration> {
        num.parse::<u64>()
            .map(|n| Duration::from_millis(n * mul))
            .map_err(|_| ProxyError::InvalidUrl(format!("bad duration: {s}")))
    };
    if let Some(num) = s.strip_suffix("ms") {
        parse(num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        parse(num, 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        parse(num, 60_000)
    } else {
        parse(s, 1000)
    }
}

pub fn new_neoreg(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    let key = match proxy.username() {
        "" => return Err(ProxyError::MissingUsername),
        key => key.to_owned(),
    };
    let tls = client::base_scheme(proxy) == "NEOREGS" || client::scheme_has_tls(proxy);
    let target = HttpTarget::from_url(proxy, tls)?;
    let config = NeoregConfig::from_query(proxy)?;

    Ok(Arc::new(NeoregDialer {
        target,
        material: Arc::new(KeyMaterial::derive(&key)),
        config,
        upstream,
    }))
}

struct NeoregDialer {
    target: HttpTarget,
    material: Arc<KeyMaterial>,
    config: NeoregConfig,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for NeoregDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        client::ensure_tcp(network)?;
        let stream = conn::open_session(
            &self.target,
            self.material.clone(),
            &self.config,
            self.upstream.clone(),
            address,
        )
        .await?;
        Ok(Box::new(stream))
    }
}
