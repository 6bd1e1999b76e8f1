//! Shadowsocks stream-cipher transport.
//!
//! Wraps a fresh upstream stream per dial with an aes-ctr keystream in
//! each direction. Key derivation is OpenSSL's EVP_BytesToKey (md5
//! chain) over the password; each direction starts with its own random
//! IV, and the first encrypted bytes of a dial are the standard
//! `ATYP || addr || port` request header.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use aes::cipher::{KeyIvInit, StreamCipher};
use async_trait::async_trait;
use base64::Engine;
use md5::{Digest, Md5};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use url::Url;

use crate::client::{self, Dialer, DynDialer, split_host_port};
use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;

const IV_LEN: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type Aes192Ctr = ctr::Ctr128BE<aes::Aes192>;
type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
}

impl Method {
    fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aes-128-ctr" => Ok(Self::Aes128Ctr),
            "aes-192-ctr" => Ok(Self::Aes192Ctr),
            "aes-256-ctr" => Ok(Self::Aes256Ctr),
            other => Err(ProxyError::InvalidUrl(format!("unknown cipher: {other}"))),
        }
    }

    fn key_len(self) -> usize {
        match self {
            Self::Aes128Ctr => 16,
            Self::Aes192Ctr => 24,
            Self::Aes256Ctr => 32,
        }
    }
}

enum Keystream {
    Aes128(Box<Aes128Ctr>),
    Aes192(Box<Aes192Ctr>),
    Aes256(Box<Aes256Ctr>),
}

impl Keystream {
    fn new(method: Method, key: &[u8], iv: &[u8]) -> Result<Self> {
        let bad = |_| ProxyError::Protocol("bad cipher key or iv length".into());
        Ok(match method {
            Method::Aes128Ctr => Self::Aes128(Box::new(
                Aes128Ctr::new_from_slices(key, iv).map_err(bad)?,
            )),
            Method::Aes192Ctr => Self::Aes192(Box::new(
                Aes192Ctr::new_from_slices(key, iv).map_err(bad)?,
            )),
            Method::Aes256Ctr => Self::Aes256(Box::new(
                Aes256Ctr::new_from_slices(key, iv).map_err(bad)?,
            )),
        })
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Self::Aes128(cipher) => cipher.apply_keystream(data),
            Self::Aes192(cipher) => cipher.apply_keystream(data),
            Self::Aes256(cipher) => cipher.apply_keystream(data),
        }
    }
}

/// OpenSSL EVP_BytesToKey with md5 and no salt.
fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 15);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut md5 = Md5::new();
        md5.update(&prev);
        md5.update(password);
        prev = md5.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// `ATYP || DST.ADDR || DST.PORT` request header.
fn build_address_header(host: &str, port: u16) -> Result<Vec<u8>> {
    if host.is_empty() {
        return Err(ProxyError::InvalidUrl("empty host".into()));
    }
    let mut header = Vec::with_capacity(host.len() + 4);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            header.push(0x01);
            header.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            header.push(0x04);
            header.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(ProxyError::InvalidUrl("target host name too long".into()));
            }
            header.push(0x03);
            header.push(host.len() as u8);
            header.extend_from_slice(host.as_bytes());
        }
    }
    header.extend_from_slice(&port.to_be_bytes());
    Ok(header)
}

pub fn new_shadowsocks(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    let (method, password) = credentials(proxy)?;
    let method = Method::parse(&method)?;
    Ok(Arc::new(ShadowsocksDialer {
        authority: client::proxy_authority(proxy, 8388)?,
        method,
        key: evp_bytes_to_key(password.as_bytes(), method.key_len()),
        upstream,
    }))
}

/// `method:password` out of the userinfo, accepting the legacy form
/// where the whole pair is base64-encoded into the username.
fn credentials(proxy: &Url) -> Result<(String, String)> {
    match (proxy.username(), proxy.password()) {
        ("", _) => Err(ProxyError::InvalidUrl(
            "method and password is not available".into(),
        )),
        (user, Some(pass)) => Ok((user.to_owned(), pass.to_owned())),
        (user, None) => {
            // The URL parser percent-encodes base64 padding in userinfo.
            let user = user.replace("%3D", "=").replace("%3d", "=");
            let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(user.trim_end_matches('='))
                .map_err(|_| {
                    ProxyError::InvalidUrl("method and password is not available".into())
                })?;
            let text = String::from_utf8(decoded).map_err(|_| {
                ProxyError::InvalidUrl("method and password is not available".into())
            })?;
            match text.split_once(':') {
                Some((method, pass)) => Ok((method.to_owned(), pass.to_owned())),
                None => Err(ProxyError::InvalidUrl(
                    "method and password is not available".into(),
                )),
            }
        }
    }
}

struct ShadowsocksDialer {
    authority: String,
    method: Method,
    key: Vec<u8>,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for ShadowsocksDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        client::ensure_tcp(network)?;
        let (host, port) = split_host_port(address)?;
        let header = build_address_header(&host, port)?;

        let inner = self.upstream.dial("tcp", &self.authority).await?;
        let mut stream = ShadowsocksStream {
            inner,
            method: self.method,
            key: self.key.clone(),
            enc: None,
            dec: None,
            read_iv: Vec::new(),
            pending: Vec::new(),
            pending_pos: 0,
            claim: None,
        };
        stream.write_all(&header).await?;
        Ok(Box::new(stream))
    }
}

struct ShadowsocksStream {
    inner: ProxyStream,
    method: Method,
    key: Vec<u8>,
    enc: Option<Keystream>,
    dec: Option<Keystream>,
    /// Partial remote IV while it trickles in.
    read_iv: Vec<u8>,
    /// Staged ciphertext not yet flushed to the inner stream.
    pending: Vec<u8>,
    pending_pos: usize,
    /// Plaintext byte count the staged write will answer for.
    claim: Option<usize>,
}

impl AsyncRead for ShadowsocksStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.dec.is_none() {
            while this.read_iv.len() < IV_LEN {
                let mut tmp = [0u8; IV_LEN];
                let mut iv_buf = ReadBuf::new(&mut tmp[..IV_LEN - this.read_iv.len()]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut iv_buf) {
                    Poll::Ready(Ok(())) => {
                        if iv_buf.filled().is_empty() {
                            // EOF before any payload.
                            return Poll::Ready(Ok(()));
                        }
                        this.read_iv.extend_from_slice(iv_buf.filled());
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            let keystream = Keystream::new(this.method, &this.key, &this.read_iv)
                .map_err(io::Error::from)?;
            this.dec = Some(keystream);
        }

        let pre = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if let Some(dec) = this.dec.as_mut() {
                    dec.apply(&mut buf.filled_mut()[pre..]);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for ShadowsocksStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.claim.is_none() {
            let mut staged = Vec::with_capacity(buf.len() + IV_LEN);
            if this.enc.is_none() {
                let iv: [u8; IV_LEN] = rand::rng().random();
                let keystream =
                    Keystream::new(this.method, &this.key, &iv).map_err(io::Error::from)?;
                this.enc = Some(keystream);
                staged.extend_from_slice(&iv);
            }
            let mut data = buf.to_vec();
            if let Some(enc) = this.enc.as_mut() {
                enc.apply(&mut data);
            }
            staged.extend_from_slice(&data);
            this.pending = staged;
            this.pending_pos = 0;
            this.claim = Some(buf.len());
        }

        while this.pending_pos < this.pending.len() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending[this.pending_pos..]) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "inner stream closed",
                    )));
                }
                Poll::Ready(Ok(n)) => this.pending_pos += n,
                Poll::Ready(Err(e)) => {
                    this.pending.clear();
                    this.pending_pos = 0;
                    this.claim = None;
                    return Poll::Ready(Err(e));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
        this.pending.clear();
        this.pending_pos = 0;
        Poll::Ready(Ok(this.claim.take().unwrap_or(buf.len())))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
