//! Dialer contract, scheme registry and chain composition.
//!
//! A proxy is named by URL; the scheme (case-insensitive, `+tls` suffix
//! allowed) selects a factory from the process-wide registry. Factories
//! consume the URL plus an upstream dialer and return a new dialer, so
//! chains compose by folding: each proxy is dialed through the one before
//! it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;

/// Maps `(network, address)` to a byte stream. `network` is one of
/// `tcp`/`tcp4`/`tcp6`; transports that cannot express other networks
/// must reject them.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream>;
}

pub type DynDialer = Arc<dyn Dialer>;

/// Builds a dialer for one proxy URL on top of an upstream dialer.
pub type Factory = fn(&Url, DynDialer) -> Result<DynDialer>;

static SCHEMES: LazyLock<RwLock<HashMap<String, Factory>>> = LazyLock::new(|| {
    let mut m: HashMap<String, Factory> = HashMap::new();
    m.insert("DIRECT".into(), crate::transport::trivial::new_direct);
    m.insert("REJECT".into(), crate::transport::trivial::new_reject);
    m.insert("BLACKHOLE".into(), crate::transport::trivial::new_blackhole);
    m.insert("SOCKS".into(), crate::transport::socks::new_socks);
    m.insert("SOCKS4".into(), crate::transport::socks::new_socks);
    m.insert("SOCKS4A".into(), crate::transport::socks::new_socks);
    m.insert("SOCKS5".into(), crate::transport::socks::new_socks);
    m.insert("HTTP".into(), crate::transport::http_connect::new_http_connect);
    m.insert("HTTPS".into(), crate::transport::http_connect::new_http_connect);
    m.insert("SS".into(), crate::transport::shadowsocks::new_shadowsocks);
    m.insert("SSH".into(), crate::transport::ssh::new_ssh);
    m.insert("NEOREG".into(), crate::neoreg::new_neoreg);
    m.insert("NEOREGS".into(), crate::neoreg::new_neoreg);
    m.insert("SUO5".into(), crate::suo5::new_suo5);
    m.insert("SUO5S".into(), crate::suo5::new_suo5);
    RwLock::new(m)
});

/// Register (or replace) a scheme factory. Intended for startup, before
/// the first dial.
pub fn register_scheme(name: &str, factory: Factory) {
    SCHEMES.write().insert(name.to_uppercase(), factory);
}

pub fn supported_schemes() -> Vec<String> {
    let mut names: Vec<String> = SCHEMES.read().keys().cloned().collect();
    names.sort();
    names
}

/// Build a dialer for `proxy` on top of the system TCP dialer.
pub fn new_client(proxy: &Url) -> Result<DynDialer> {
    new_client_with_dialer(proxy, system_dialer())
}

/// Build a dialer for `proxy` on top of an explicit upstream.
pub fn new_client_with_dialer(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    let factory = {
        let schemes = SCHEMES.read();
        schemes.get(&base_scheme(proxy)).copied()
    };
    match factory {
        Some(factory) => {
            debug!(scheme = proxy.scheme(), host = ?proxy.host_str(), "building proxy client");
            factory(proxy, upstream)
        }
        None => Err(ProxyError::UnsupportedScheme(proxy.scheme().to_owned())),
    }
}

/// Fold a chain of proxies left to right: each URL's dialer uses the
/// previously built dialer as its upstream, so the returned (outermost)
/// dialer tunnels through every listed proxy in order.
pub fn new_client_chain(proxies: &[Url]) -> Result<DynDialer> {
    new_client_chain_with_dialer(proxies, system_dialer())
}

pub fn new_client_chain_with_dialer(proxies: &[Url], upstream: DynDialer) -> Result<DynDialer> {
    let mut dialer = upstream;
    for proxy in proxies {
        dialer = new_client_with_dialer(proxy, dialer)?;
    }
    Ok(dialer)
}

/// Uppercased scheme with any `+suffix` stripped, the registry key.
pub(crate) fn base_scheme(proxy: &Url) -> String {
    let scheme = proxy.scheme().to_uppercase();
    match scheme.split_once('+') {
        Some((base, _)) => base.to_owned(),
        None => scheme,
    }
}

/// Whether the scheme carries a `+tls` suffix.
pub(crate) fn scheme_has_tls(proxy: &Url) -> bool {
    proxy
        .scheme()
        .split_once('+')
        .is_some_and(|(_, suffix)| suffix.eq_ignore_ascii_case("tls"))
}

/// `host:port` of the proxy itself, with a scheme-specific default port.
pub(crate) fn proxy_authority(proxy: &Url, default_port: u16) -> Result<String> {
    let host = proxy
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUrl("missing host".into()))?;
    let port = proxy.port().unwrap_or(default_port);
    Ok(format!("{host}:{port}"))
}

/// Split a dial address into host and port; IPv6 literals lose their
/// brackets.
pub(crate) fn split_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::InvalidUrl(format!("missing port in address: {address}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::InvalidUrl(format!("bad port in address: {address}")))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_owned(), port))
}

pub(crate) fn ensure_tcp(network: &str) -> Result<()> {
    match network {
        n if n.eq_ignore_ascii_case("tcp")
            || n.eq_ignore_ascii_case("tcp4")
            || n.eq_ignore_ascii_case("tcp6") =>
        {
            Ok(())
        }
        other => Err(ProxyError::UnsupportedNetwork(other.to_owned())),
    }
}

// ── System dialer ────────────────────────────────────────────────────

/// Plain `tokio::net::TcpStream` dialer, the default innermost layer of
/// every chain. `tcp4`/`tcp6` restrict the resolved address family.
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        ensure_tcp(network)?;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address).await?.collect();
        let mut last_err = None;
        for addr in addrs {
            let family_ok = match network {
                n if n.eq_ignore_ascii_case("tcp4") => addr.is_ipv4(),
                n if n.eq_ignore_ascii_case("tcp6") => addr.is_ipv6(),
                _ => true,
            };
            if !family_ok {
                continue;
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => ProxyError::Io(e),
            None => ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no usable address for {address}"),
            )),
        })
    }
}

pub fn system_dialer() -> DynDialer {
    Arc::new(SystemDialer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_lookup_is_case_insensitive() {
        let a = Url::parse("socks5+tls://127.0.0.1:1080").unwrap();
        let b = Url::parse("SOCKS5+TLS://127.0.0.1:1080").unwrap();
        assert_eq!(base_scheme(&a), "SOCKS5");
        assert_eq!(base_scheme(&b), "SOCKS5");
        assert!(scheme_has_tls(&a));
        assert!(scheme_has_tls(&b));

        let plain = Url::parse("socks5://127.0.0.1:1080").unwrap();
        assert!(!scheme_has_tls(&plain));
    }

    #[test]
    fn address_splitting() {
        assert_eq!(
            split_host_port("example.com:8080").unwrap(),
            ("example.com".to_owned(), 8080)
        );
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1".to_owned(), 443));
        assert!(split_host_port("noport").is_err());
        assert!(split_host_port("host:notanumber").is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let url = Url::parse("carrier-pigeon://host:1").unwrap();
        assert!(matches!(
            new_client(&url),
            Err(ProxyError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn tls_variant_resolves_to_same_factory() {
        let schemes = supported_schemes();
        assert!(schemes.contains(&"SOCKS5".to_string()));
        // +tls variants are not separate registry entries; the suffix is
        // stripped before lookup.
        assert!(!schemes.iter().any(|s| s.contains('+')));

        let url = Url::parse("socks5+tls://127.0.0.1:1080").unwrap();
        assert!(new_client(&url).is_ok());
    }
}
