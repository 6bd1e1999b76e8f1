//! SSH transport.
//!
//! One authenticated session per unique proxy URL, cached for the
//! process lifetime; every dial opens a fresh direct-tcpip channel over
//! the cached session. Lookups dominate, so the cache sits behind a
//! read/write lock with the read path first.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::client;
use tracing::debug;
use url::Url;

use crate::client::{self as registry, Dialer, DynDialer, split_host_port};
use crate::error::{ProxyError, Result};
use crate::stream::ProxyStream;

type Session = Arc<tokio::sync::Mutex<client::Handle<AcceptAll>>>;

/// Keyed by the full URL string; intentionally never evicted.
static SESSIONS: LazyLock<RwLock<HashMap<String, Session>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Host-key checking is not part of this transport's contract.
struct AcceptAll;

#[async_trait]
impl client::Handler for AcceptAll {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

pub fn new_ssh(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    if proxy.username().is_empty() {
        return Err(ProxyError::MissingUsername);
    }
    Ok(Arc::new(SshDialer {
        proxy: proxy.clone(),
        authority: registry::proxy_authority(proxy, 22)?,
        upstream,
    }))
}

struct SshDialer {
    proxy: Url,
    authority: String,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        registry::ensure_tcp(network)?;
        let session = self.session().await?;
        let (host, port) = split_host_port(address)?;
        let channel = {
            let guard = session.lock().await;
            guard
                .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| ProxyError::Handshake(e.to_string()))?
        };
        Ok(Box::new(channel.into_stream()))
    }
}

impl SshDialer {
    async fn session(&self) -> Result<Session> {
        let cache_key = self.proxy.as_str().to_owned();
        if let Some(session) = SESSIONS.read().get(&cache_key) {
            return Ok(session.clone());
        }

        let stream = self.upstream.dial("tcp", &self.authority).await?;
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect_stream(config, stream, AcceptAll)
            .await
            .map_err(|e| ProxyError::Handshake(e.to_string()))?;

        let user = self.proxy.username();
        let mut authenticated = false;

        let key_path = self
            .proxy
            .query_pairs()
            .find(|(name, _)| name == "public-key")
            .map(|(_, value)| value.into_owned());
        if let Some(path) = key_path {
            let key = russh::keys::load_secret_key(&path, None)
                .map_err(|e| ProxyError::Handshake(format!("cannot load key {path}: {e}")))?;
            authenticated = handle
                .authenticate_publickey(user, Arc::new(key))
                .await
                .map_err(|e| ProxyError::Handshake(e.to_string()))?;
        }
        if !authenticated {
            if let Some(password) = self.proxy.password() {
                authenticated = handle
                    .authenticate_password(user, password)
                    .await
                    .map_err(|e| ProxyError::Handshake(e.to_string()))?;
            }
        }
        if !authenticated {
            return Err(ProxyError::Handshake("ssh authentication failed".into()));
        }
        debug!(authority = %self.authority, user, "ssh session established");

        let session = Arc::new(tokio::sync::Mutex::new(handle));
        // A racing dial may have beaten us here; the first one in wins
        // and the loser's session is dropped.
        let mut cache = SESSIONS.write();
        Ok(cache
            .entry(cache_key)
            .or_insert_with(|| session.clone())
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_is_required() {
        let url = Url::parse("ssh://host:22").unwrap();
        assert!(matches!(
            new_ssh(&url, crate::client::system_dialer()),
            Err(ProxyError::MissingUsername)
        ));
    }
}
