//! Minimal HTTP/1.1 plumbing for the mock tunnel servers.
//!
//! The mocks speak just enough HTTP to exercise the client: request
//! heads, content-length and chunked bodies, and streamed chunked
//! responses.

#![allow(dead_code)]

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

/// Read a request head; `None` on a cleanly closed connection.
pub async fn read_head(stream: &mut TcpStream) -> Option<RequestHead> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) => return None,
            Ok(_) => head.push(byte[0]),
            Err(_) => return None,
        }
        assert!(head.len() < 64 * 1024, "oversized request head");
    }
    let text = String::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_owned();
    let path = request_line.next()?.to_owned();
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }
    Some(RequestHead {
        method,
        path,
        headers,
    })
}

/// One chunk of a chunked body; `None` on the terminal chunk.
pub async fn read_chunk(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut size_line = Vec::new();
    let mut byte = [0u8; 1];
    while !size_line.ends_with(b"\r\n") {
        stream.read_exact(&mut byte).await.ok()?;
        size_line.push(byte[0]);
    }
    let size_text = std::str::from_utf8(&size_line).ok()?.trim();
    let size = usize::from_str_radix(size_text.split(';').next()?, 16).ok()?;
    if size == 0 {
        let mut crlf = [0u8; 2];
        stream.read_exact(&mut crlf).await.ok();
        return None;
    }
    let mut data = vec![0u8; size];
    stream.read_exact(&mut data).await.ok()?;
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await.ok()?;
    Some(data)
}

/// Whole request body, via content-length or chunked framing.
pub async fn read_body(stream: &mut TcpStream, head: &RequestHead) -> Vec<u8> {
    if let Some(length) = head.headers.get("content-length") {
        let length: usize = length.parse().expect("content-length");
        let mut body = vec![0u8; length];
        stream.read_exact(&mut body).await.expect("body");
        return body;
    }
    let mut body = Vec::new();
    while let Some(chunk) = read_chunk(stream).await {
        body.extend_from_slice(&chunk);
    }
    body
}

pub async fn write_response(stream: &mut TcpStream, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.expect("head");
    stream.write_all(body).await.expect("body");
    stream.flush().await.expect("flush");
}

/// Start a streamed chunked response.
pub async fn write_chunked_head(stream: &mut TcpStream) {
    stream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .expect("head");
}

pub async fn write_chunk(stream: &mut TcpStream, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let framed = format!("{:x}\r\n", data.len());
    stream.write_all(framed.as_bytes()).await.expect("chunk size");
    stream.write_all(data).await.expect("chunk data");
    stream.write_all(b"\r\n").await.expect("chunk crlf");
    stream.flush().await.expect("chunk flush");
}

pub async fn finish_chunked(stream: &mut TcpStream) {
    stream.write_all(b"0\r\n\r\n").await.expect("final chunk");
    stream.flush().await.expect("final flush");
}

/// Listener on an ephemeral localhost port.
pub async fn local_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    (listener, port)
}

/// Plain TCP echo server; returns its port.
pub async fn spawn_echo_server() -> u16 {
    let (listener, port) = local_listener().await;
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}
