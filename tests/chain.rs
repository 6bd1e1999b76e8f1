//! Framework-level scenarios: direct dialing, chain composition order,
//! and a real SOCKS5 → HTTP CONNECT → direct chain over mock proxies.

mod common;

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use proxydial::{Dialer, DynDialer, ProxyError, ProxyStream, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

#[tokio::test]
async fn direct_dial_reaches_echo_server() {
    let port = common::spawn_echo_server().await;
    let dialer = proxydial::new_client(&Url::parse("direct://").unwrap()).unwrap();
    let mut stream = dialer
        .dial("tcp", &format!("127.0.0.1:{port}"))
        .await
        .unwrap();

    stream.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping");
}

#[tokio::test]
async fn direct_rejects_unknown_network() {
    let dialer = proxydial::new_client(&Url::parse("direct://").unwrap()).unwrap();
    let err = match dialer.dial("udp", "127.0.0.1:53").await {
        Ok(_) => panic!("expected dial to fail"),
        Err(e) => e,
    };
    assert!(matches!(err, ProxyError::UnsupportedNetwork(_)));
}

// ── Chain nesting order ──────────────────────────────────────────────

static EVENTS: LazyLock<Mutex<Vec<(String, String)>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Each layer records the address it was asked for, then dials its own
/// "proxy authority" through its upstream.
struct Recording {
    label: String,
    upstream: DynDialer,
}

#[async_trait]
impl Dialer for Recording {
    async fn dial(&self, network: &str, address: &str) -> Result<ProxyStream> {
        EVENTS.lock().push((self.label.clone(), address.to_owned()));
        self.upstream
            .dial(network, &format!("{}.proxy:9", self.label))
            .await
    }
}

fn recording_factory(proxy: &Url, upstream: DynDialer) -> Result<DynDialer> {
    Ok(Arc::new(Recording {
        label: proxy.host_str().unwrap_or_default().to_owned(),
        upstream,
    }))
}

/// Innermost stub standing in for the system dialer.
struct Terminal;

#[async_trait]
impl Dialer for Terminal {
    async fn dial(&self, _network: &str, address: &str) -> Result<ProxyStream> {
        EVENTS.lock().push(("terminal".into(), address.to_owned()));
        let (client, _server) = tokio::io::duplex(64);
        Ok(Box::new(client))
    }
}

#[tokio::test]
async fn chain_nests_left_to_right() {
    proxydial::register_scheme("RECTEST", recording_factory);

    let urls = [
        Url::parse("rectest://one").unwrap(),
        Url::parse("rectest://two").unwrap(),
        Url::parse("rectest://three").unwrap(),
    ];
    let chain = proxydial::new_client_chain_with_dialer(&urls, Arc::new(Terminal)).unwrap();

    EVENTS.lock().clear();
    chain.dial("tcp", "target:1").await.unwrap();

    // The last URL is the outermost layer; every layer dials its own
    // proxy through the one built before it, exactly once.
    let events = EVENTS.lock().clone();
    assert_eq!(
        events,
        vec![
            ("three".to_owned(), "target:1".to_owned()),
            ("two".to_owned(), "three.proxy:9".to_owned()),
            ("one".to_owned(), "two.proxy:9".to_owned()),
            ("terminal".to_owned(), "one.proxy:9".to_owned()),
        ]
    );
}

// ── Mock proxies for the full chain scenario ─────────────────────────

/// SOCKS5 server: no-auth handshake, then splice to the target.
async fn spawn_socks5_proxy() -> u16 {
    let (listener, port) = common::local_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                socket.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                socket.read_exact(&mut methods).await.unwrap();
                socket.write_all(&[0x05, 0x00]).await.unwrap();

                let mut head = [0u8; 4];
                socket.read_exact(&mut head).await.unwrap();
                assert_eq!(head[1], 0x01, "CONNECT expected");
                let target = match head[3] {
                    0x01 => {
                        let mut addr = [0u8; 4];
                        socket.read_exact(&mut addr).await.unwrap();
                        std::net::Ipv4Addr::from(addr).to_string()
                    }
                    0x03 => {
                        let mut len = [0u8; 1];
                        socket.read_exact(&mut len).await.unwrap();
                        let mut name = vec![0u8; len[0] as usize];
                        socket.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    other => panic!("unexpected atyp {other}"),
                };
                let mut port_bytes = [0u8; 2];
                socket.read_exact(&mut port_bytes).await.unwrap();
                let port = u16::from_be_bytes(port_bytes);

                let mut outbound = TcpStream::connect((target.as_str(), port)).await.unwrap();
                socket
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut socket, &mut outbound).await;
            });
        }
    });
    port
}

/// HTTP proxy: CONNECT, 200, splice.
async fn spawn_http_connect_proxy() -> u16 {
    let (listener, port) = common::local_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let head = common::read_head(&mut socket).await.unwrap();
                assert_eq!(head.method, "CONNECT");
                let mut outbound = TcpStream::connect(&head.path).await.unwrap();
                socket
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut socket, &mut outbound).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn socks5_and_connect_chain_preserves_bytes() {
    let echo_port = common::spawn_echo_server().await;
    let socks_port = spawn_socks5_proxy().await;
    let http_port = spawn_http_connect_proxy().await;

    let chain = proxydial::new_client_chain(&[
        Url::parse(&format!("socks5://127.0.0.1:{socks_port}")).unwrap(),
        Url::parse(&format!("http://127.0.0.1:{http_port}")).unwrap(),
    ])
    .unwrap();

    let mut stream = chain
        .dial("tcp", &format!("127.0.0.1:{echo_port}"))
        .await
        .unwrap();

    let payload: Vec<u8> = (0..2048u32).flat_map(|i| i.to_le_bytes()).collect();
    stream.write_all(&payload).await.unwrap();

    let mut reply = vec![0u8; payload.len()];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, payload);
}

#[tokio::test]
async fn socks5_dial_through_mock_proxy() {
    let echo_port = common::spawn_echo_server().await;
    let socks_port = spawn_socks5_proxy().await;

    let dialer = proxydial::new_client(
        &Url::parse(&format!("socks5://127.0.0.1:{socks_port}")).unwrap(),
    )
    .unwrap();
    let mut stream = dialer
        .dial("tcp", &format!("127.0.0.1:{echo_port}"))
        .await
        .unwrap();

    stream.write_all(b"through socks").await.unwrap();
    let mut reply = [0u8; 13];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"through socks");
}
