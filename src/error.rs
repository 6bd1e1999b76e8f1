//! Crate-wide error type.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("unsupported proxy client")]
    UnsupportedScheme(String),

    #[error("unsupported network type")]
    UnsupportedNetwork(String),

    #[error("must set username")]
    MissingUsername,

    #[error("invalid proxy url: {0}")]
    InvalidUrl(String),

    #[error("no dialers available")]
    NoDialers,

    // ── Handshake ────────────────────────────────────────────────────
    #[error("connect failed")]
    ConnectFailed,

    #[error("connection rejected")]
    Rejected,

    #[error("handshake failed: {0}")]
    Handshake(String),

    // ── Streaming ────────────────────────────────────────────────────
    #[error("read failed")]
    ReadFailed,

    #[error("write failed")]
    WriteFailed,

    #[error("connection closed")]
    Closed,

    #[error("http request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    // ── Protocol violations ──────────────────────────────────────────
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl From<ProxyError> for io::Error {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}
