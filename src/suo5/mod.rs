//! Suo5 transport: an HTTP streaming socket tunnel.
//!
//! Unlike neoreg there is no polling loop; the server streams response
//! frames over one long-lived exchange. When the path to the server can
//! carry a request body and a response body at the same time the tunnel
//! runs full duplex over a single POST; behind buffering middleware it
//! falls back to half duplex, where the long-lived response carries
//! reads and each write is a fresh short POST.

pub mod frame;

mod conn;
mod ctrl;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::client::{self, Dialer, DynDialer};
use crate::error::Result;
use crate::http1::HttpTarget;
use crate::stream::ProxyStream;

/// Whether the server can stream both directions of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplexMode {
    Full,
    Half,
}

#[derive(Debug, Clone)]
pub struct Suo5Config {
    /// Handshake and short-request timeout. The long-lived read streams
    /// are deliberately not bounded by it.
    pub timeout: Duration,
    pub enable_heartbeat: bool,
    pub heartbeat_interval: Duration,
    /// Keep every cookie the server sets; when off, only `PHPSESSID`
    /// survives (PHP back-ends need session continuity, nothing else may
    /// accumulate).
    pub enable_cookiejar: bool,
    /// Passed to the server in the Create action; it forwards the tunnel
    /// to this inner URL.
    pub redirect_url: Option<String>,
}

impl Default for Suo5Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            enable_heartbeat: true,
            heartbeat_interval: Duration::from_secs(5),
            enable_cookiejar: false,
            redirect_url: None,
        }
    }
}

pub fn new_suo5(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    new_suo5_with_config(proxy, upstream, Suo5Config::default())
}

pub fn new_suo5_with_config(
    proxy: &Url,
    upstream: DynDialer,
    config: Suo5Config,
) -> Result<DynDialer> {
    let tls = client::base_scheme(proxy) == "SUO5S" || client::scheme_has_tls(proxy);
    let target = HttpTarget::from_url(proxy, tls)?;
    let jar = Arc::new(CookieJar::new(config.enable_cookiejar));
    Ok(Arc::new(Suo5Dialer {
        target,
        config,
        upstream,
        jar,
        mode: OnceCell::new(),
    }))
}

pub(crate) struct Suo5Dialer {
    pub(crate) target: HttpTarget,
    pub(crate) config: Suo5Config,
    pub(crate) upstream: DynDialer,
    pub(crate) jar: Arc<CookieJar>,
    /// Probed once, on the first dial.
    mode: OnceCell<(DuplexMode, usize)>,
}

#[async_trait]
impl Dialer for Suo5Dialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        client::ensure_tcp(network)?;
        let (mode, offset) = *self
            .mode
            .get_or_try_init(|| ctrl::check_connect_mode(self))
            .await?;
        debug!(?mode, offset, "suo5 duplex mode");
        conn::open_session(self, mode, offset, address).await
    }
}

// ── Cookie jar ───────────────────────────────────────────────────────

/// Either a full jar or a selective one that persists only `PHPSESSID`.
pub(crate) struct CookieJar {
    keep_all: bool,
    cookies: Mutex<HashMap<String, String>>,
}

impl CookieJar {
    fn new(keep_all: bool) -> Self {
        Self {
            keep_all,
            cookies: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn store(&self, headers: &hyper::HeaderMap) {
        let mut cookies = self.cookies.lock();
        for value in headers.get_all(hyper::header::SET_COOKIE) {
            let Ok(text) = value.to_str() else { continue };
            let Some((name, val)) = text.split(';').next().and_then(|kv| kv.split_once('=')) else {
                continue;
            };
            let name = name.trim();
            if self.keep_all || name.eq_ignore_ascii_case("PHPSESSID") {
                cookies.insert(name.to_owned(), val.trim().to_owned());
            }
        }
    }

    pub(crate) fn header(&self) -> Option<String> {
        let cookies = self.cookies.lock();
        if cookies.is_empty() {
            return None;
        }
        Some(
            cookies
                .iter()
                .map(|(name, val)| format!("{name}={val}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(values: &[&str]) -> hyper::HeaderMap {
        let mut headers = hyper::HeaderMap::new();
        for v in values {
            headers.append(hyper::header::SET_COOKIE, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn selective_jar_keeps_only_php_session() {
        let jar = CookieJar::new(false);
        jar.store(&headers_with(&[
            "PHPSESSID=abc123; Path=/; HttpOnly",
            "tracking=evil; Max-Age=999999",
        ]));
        assert_eq!(jar.header().unwrap(), "PHPSESSID=abc123");
    }

    #[test]
    fn full_jar_keeps_everything() {
        let jar = CookieJar::new(true);
        jar.store(&headers_with(&["a=1", "b=2; Secure"]));
        let header = jar.header().unwrap();
        assert!(header.contains("a=1"));
        assert!(header.contains("b=2"));
    }

    #[test]
    fn empty_jar_sends_nothing() {
        let jar = CookieJar::new(true);
        assert!(jar.header().is_none());
    }
}
