//! Plain HTTP/HTTPS CONNECT transport.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::client::{self, Dialer, DynDialer};
use crate::error::{ProxyError, Result};
use crate::http1::BROWSER_UA;
use crate::stream::ProxyStream;
use crate::tls::wrap_tls;

/// Response headers larger than this are not a CONNECT reply.
const MAX_RESPONSE_HEADER: usize = 8 * 1024;

pub fn new_http_connect(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    let tls = client::base_scheme(proxy) == "HTTPS" || client::scheme_has_tls(proxy);
    let host = proxy
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUrl("missing host".into()))?
        .to_owned();
    let basic_auth = match proxy.username() {
        "" => None,
        user => {
            let pass = proxy.password().unwrap_or_default();
            Some(base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}")))
        }
    };
    Ok(Arc::new(HttpConnectDialer {
        authority: client::proxy_authority(proxy, if tls { 443 } else { 80 })?,
        host,
        tls,
        basic_auth,
        upstream,
    }))
}

struct HttpConnectDialer {
    authority: String,
    host: String,
    tls: bool,
    basic_auth: Option<String>,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for HttpConnectDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        client::ensure_tcp(network)?;
        let stream = self.upstream.dial("tcp", &self.authority).await?;
        let mut stream = if self.tls {
            wrap_tls(stream, &self.host).await?
        } else {
            stream
        };

        let mut request = format!(
            "CONNECT {address} HTTP/1.1\r\nHost: {address}\r\nUser-Agent: {BROWSER_UA}\r\nProxy-Connection: Keep-Alive\r\n"
        );
        if let Some(auth) = &self.basic_auth {
            request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        // Read the response head byte-wise so no tunnel bytes are
        // consumed past the blank line.
        let mut head = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_RESPONSE_HEADER {
                return Err(ProxyError::Handshake("oversized connect response".into()));
            }
            stream.read_exact(&mut byte).await?;
            head.push(byte[0]);
        }

        let status = parse_status(&head)?;
        if !(200..300).contains(&status) {
            return Err(ProxyError::Handshake(format!(
                "connect rejected with status {status}"
            )));
        }
        Ok(stream)
    }
}

/// Status code out of `HTTP/1.x NNN reason`.
fn parse_status(head: &[u8]) -> Result<u16> {
    let line = head
        .split(|&b| b == b'\r')
        .next()
        .unwrap_or_default();
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Handshake("malformed connect response".into()))?;
    let mut parts = text.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| ProxyError::Handshake("malformed connect status".into())),
        _ => Err(ProxyError::Handshake("malformed connect response".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status(b"HTTP/1.1 200 Connection established\r\n\r\n").unwrap(), 200);
        assert_eq!(parse_status(b"HTTP/1.0 407 Proxy Auth Required\r\n\r\n").unwrap(), 407);
        assert!(parse_status(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_status(b"").is_err());
    }
}
