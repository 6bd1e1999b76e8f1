//! SOCKS 4/4a/5 client handshakes.
//!
//! One handshake on a fresh upstream stream; afterwards that stream is
//! handed back untouched as the data stream.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use crate::client::{self, Dialer, DynDialer, split_host_port};
use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;
use crate::tls::wrap_tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    V4,
    V4A,
    V5,
}

pub fn new_socks(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    let version = match client::base_scheme(proxy).as_str() {
        "SOCKS4" => Version::V4,
        "SOCKS4A" => Version::V4A,
        _ => Version::V5,
    };
    let host = proxy
        .host_str()
        .ok_or_else(|| ProxyError::InvalidUrl("missing host".into()))?
        .to_owned();
    let username = match proxy.username() {
        "" => None,
        user => Some(user.to_owned()),
    };
    Ok(Arc::new(SocksDialer {
        version,
        authority: client::proxy_authority(proxy, 1080)?,
        host,
        tls: client::scheme_has_tls(proxy),
        username,
        password: proxy.password().map(str::to_owned),
        upstream,
    }))
}

struct SocksDialer {
    version: Version,
    authority: String,
    host: String,
    tls: bool,
    username: Option<String>,
    password: Option<String>,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for SocksDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        client::ensure_tcp(network)?;
        let stream = self.upstream.dial("tcp", &self.authority).await?;
        let mut stream = if self.tls {
            wrap_tls(stream, &self.host).await?
        } else {
            stream
        };
        let (host, port) = split_host_port(address)?;
        match self.version {
            Version::V5 => self.handshake_v5(&mut stream, &host, port).await?,
            Version::V4 | Version::V4A => self.handshake_v4(&mut stream, &host, port).await?,
        }
        Ok(stream)
    }
}

impl SocksDialer {
    async fn handshake_v5(&self, stream: &mut ProxyStream, host: &str, port: u16) -> Result<()> {
        // Method selection: no-auth, plus username/password when we have
        // credentials.
        let greeting: &[u8] = if self.username.is_some() {
            &[0x05, 0x02, 0x00, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != 0x05 {
            return Err(ProxyError::Handshake(format!(
                "bad socks version {:#04x}",
                choice[0]
            )));
        }
        match choice[1] {
            0x00 => {}
            0x02 => self.subnegotiate(stream).await?,
            0xff => return Err(ProxyError::Handshake("no acceptable auth method".into())),
            other => {
                return Err(ProxyError::Handshake(format!(
                    "unsupported auth method {other:#04x}"
                )));
            }
        }

        // CONNECT request.
        let mut request = vec![0x05, 0x01, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.push(0x01);
                request.extend_from_slice(&ip.octets());
            }
            Ok(IpAddr::V6(ip)) => {
                request.push(0x04);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if host.len() > 255 {
                    return Err(ProxyError::Handshake("target host name too long".into()));
                }
                request.push(0x03);
                request.push(host.len() as u8);
                request.extend_from_slice(host.as_bytes());
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT.
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(ProxyError::Handshake(format!(
                "connect refused by proxy: {}",
                reply_message(head[1])
            )));
        }
        let addr_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(ProxyError::Handshake(format!(
                    "bad bound address type {other:#04x}"
                )));
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }

    async fn subnegotiate(&self, stream: &mut ProxyStream) -> Result<()> {
        let user = self.username.as_deref().unwrap_or_default();
        let pass = self.password.as_deref().unwrap_or_default();
        if user.len() > 255 || pass.len() > 255 {
            return Err(ProxyError::Handshake("credentials too long".into()));
        }
        let mut msg = vec![0x01, user.len() as u8];
        msg.extend_from_slice(user.as_bytes());
        msg.push(pass.len() as u8);
        msg.extend_from_slice(pass.as_bytes());
        stream.write_all(&msg).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(ProxyError::Handshake("authentication rejected".into()));
        }
        Ok(())
    }

    async fn handshake_v4(&self, stream: &mut ProxyStream, host: &str, port: u16) -> Result<()> {
        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&port.to_be_bytes());

        let domain = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => {
                request.extend_from_slice(&ip.octets());
                None
            }
            Ok(IpAddr::V6(_)) => {
                return Err(ProxyError::Handshake("socks4 cannot carry ipv6".into()));
            }
            Err(_) if self.version == Version::V4A => {
                // 0.0.0.1 marker; the hostname rides behind the userid.
                request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
                Some(host)
            }
            Err(_) => {
                // Plain SOCKS4 needs an IPv4 address; resolve locally.
                let resolved = tokio::net::lookup_host((host, port))
                    .await?
                    .find_map(|addr| match addr.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })
                    .ok_or_else(|| {
                        ProxyError::Handshake(format!("no ipv4 address for {host}"))
                    })?;
                request.extend_from_slice(&resolved.octets());
                None
            }
        };

        if let Some(user) = &self.username {
            request.extend_from_slice(user.as_bytes());
        }
        request.push(0x00);
        if let Some(domain) = domain {
            request.extend_from_slice(domain.as_bytes());
            request.push(0x00);
        }
        stream.write_all(&request).await?;

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x5a {
            return Err(ProxyError::Handshake(format!(
                "request rejected by proxy: code {:#04x}",
                reply[1]
            )));
        }
        Ok(())
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "ttl expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
