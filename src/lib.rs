//! proxydial — outbound byte streams through chains of proxy
//! intermediaries.
//!
//! A proxy is named by URL and its scheme picks the transport:
//! `direct`, `reject`, `blackhole`, `socks4`/`socks4a`/`socks5(+tls)`,
//! `http`/`https` CONNECT, `ss` (shadowsocks), `ssh`, and the two covert
//! HTTP tunnels `neoreg(s)` and `suo5(s)`. Chains compose left to right,
//! each proxy dialed through the previous one:
//!
//! ```rust,ignore
//! let chain = proxydial::new_client_chain(&[
//!     Url::parse("socks5://gateway:1080")?,
//!     Url::parse("neoreg://secretkey@web.host/tunnel.php")?,
//! ])?;
//! let mut stream = chain.dial("tcp", "10.0.0.5:3389").await?;
//! ```
//!
//! The library never prints; diagnostics go through `tracing` and every
//! failure surfaces as a [`ProxyError`].

pub mod balance;
pub mod client;
pub mod error;
pub mod neoreg;
pub mod stream;
pub mod suo5;
pub mod transport;

mod http1;
mod tls;

pub use client::{
    Dialer, DynDialer, Factory, new_client, new_client_chain, new_client_chain_with_dialer,
    new_client_with_dialer, register_scheme, supported_schemes, system_dialer,
};
pub use error::{ProxyError, Result};
pub use stream::{ProxyStream, Stream};
