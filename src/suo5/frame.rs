//! Suo5 action frames.
//!
//! An action is a string-keyed association marshalled as
//! `u8 key-len || key || u32 BE value-len || value` records, the whole
//! payload prefixed with a u32 BE total length. Marshalling emits keys in
//! sorted order so the wire bytes are deterministic; unmarshalling
//! accepts any order.

use std::collections::BTreeMap;

use bytes::{Buf, BytesMut};

use crate::error::{ProxyError, Result};

/// Action type codes, carried under the `ac` key.
pub mod action {
    pub const CREATE: u8 = 0x00;
    pub const DATA: u8 = 0x01;
    pub const DELETE: u8 = 0x02;
    pub const HEARTBEAT: u8 = 0x03;
}

/// Well-known keys.
pub mod key {
    pub const ACTION: &str = "ac";
    pub const ID: &str = "id";
    pub const HOST: &str = "h";
    pub const PORT: &str = "p";
    pub const DATA: &str = "dt";
    pub const STATUS: &str = "s";
    pub const REDIRECT: &str = "r";
    pub const HEARTBEAT_DATA: &str = "d";
    pub const VERSION: &str = "v";
}

pub type ActionMap = BTreeMap<String, Vec<u8>>;

/// Upper bound on a single frame; anything bigger is a framing violation,
/// not a legitimate tunnel payload.
const MAX_FRAME: usize = 8 * 1024 * 1024;

pub fn marshal(map: &ActionMap) -> Vec<u8> {
    let payload_len: usize = map.iter().map(|(k, v)| 1 + k.len() + 4 + v.len()).sum();
    let mut out = Vec::with_capacity(4 + payload_len);
    out.extend_from_slice(&(payload_len as u32).to_be_bytes());
    for (k, v) in map {
        out.push(k.len() as u8);
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(&(v.len() as u32).to_be_bytes());
        out.extend_from_slice(v);
    }
    out
}

/// Parse one frame's payload (length prefix already removed).
pub fn unmarshal(mut payload: &[u8]) -> Result<ActionMap> {
    let mut map = ActionMap::new();
    while !payload.is_empty() {
        let key_len = payload[0] as usize;
        payload = &payload[1..];
        if payload.len() < key_len + 4 {
            return Err(ProxyError::Protocol("truncated action key".into()));
        }
        let key = std::str::from_utf8(&payload[..key_len])
            .map_err(|_| ProxyError::Protocol("non-utf8 action key".into()))?
            .to_owned();
        payload = &payload[key_len..];
        let value_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        payload = &payload[4..];
        if payload.len() < value_len {
            return Err(ProxyError::Protocol("truncated action value".into()));
        }
        map.insert(key, payload[..value_len].to_vec());
        payload = &payload[value_len..];
    }
    Ok(map)
}

/// Pop one complete frame off the front of `buf`, if present.
pub fn try_parse(buf: &mut BytesMut) -> Result<Option<ActionMap>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if frame_len > MAX_FRAME {
        return Err(ProxyError::Protocol(format!("oversized frame: {frame_len}")));
    }
    if buf.len() < 4 + frame_len {
        return Ok(None);
    }
    buf.advance(4);
    let payload = buf.split_to(frame_len);
    unmarshal(&payload).map(Some)
}

// ── Action constructors ──────────────────────────────────────────────

pub fn new_create(id: &str, host: &str, port: u16, redirect: Option<&str>) -> ActionMap {
    let mut map = ActionMap::from([
        (key::ACTION.to_owned(), vec![action::CREATE]),
        (key::ID.to_owned(), id.as_bytes().to_vec()),
        (key::HOST.to_owned(), host.as_bytes().to_vec()),
        (key::PORT.to_owned(), port.to_be_bytes().to_vec()),
    ]);
    if let Some(url) = redirect {
        map.insert(key::REDIRECT.to_owned(), url.as_bytes().to_vec());
    }
    map
}

pub fn new_data(id: &str, data: &[u8]) -> ActionMap {
    ActionMap::from([
        (key::ACTION.to_owned(), vec![action::DATA]),
        (key::ID.to_owned(), id.as_bytes().to_vec()),
        (key::DATA.to_owned(), data.to_vec()),
    ])
}

pub fn new_delete(id: &str) -> ActionMap {
    ActionMap::from([
        (key::ACTION.to_owned(), vec![action::DELETE]),
        (key::ID.to_owned(), id.as_bytes().to_vec()),
    ])
}

pub fn new_heartbeat(id: &str) -> ActionMap {
    ActionMap::from([
        (key::ACTION.to_owned(), vec![action::HEARTBEAT]),
        (key::ID.to_owned(), id.as_bytes().to_vec()),
        (key::HEARTBEAT_DATA.to_owned(), b"ping".to_vec()),
    ])
}

/// Action code of a parsed map, if present and well-formed.
pub fn action_of(map: &ActionMap) -> Option<u8> {
    match map.get(key::ACTION).map(Vec::as_slice) {
        Some([code]) => Some(*code),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_round_trip() {
        let create = new_create("abcd1234", "10.0.0.7", 3306, Some("http://inner/app"));
        let wire = marshal(&create);

        let frame_len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        assert_eq!(frame_len, wire.len() - 4);

        let parsed = unmarshal(&wire[4..]).unwrap();
        assert_eq!(parsed, create);
        assert_eq!(action_of(&parsed), Some(action::CREATE));
        assert_eq!(parsed[key::PORT], 3306u16.to_be_bytes().to_vec());
    }

    #[test]
    fn try_parse_handles_partial_frames() {
        let data = new_data("abcd1234", b"hello world");
        let wire = marshal(&data);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&wire[..5]);
        assert!(try_parse(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&wire[5..]);
        let parsed = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(parsed[key::DATA], b"hello world".to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn try_parse_pops_frames_in_order() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&marshal(&new_data("aaaaaaaa", b"one")));
        buf.extend_from_slice(&marshal(&new_heartbeat("aaaaaaaa")));
        buf.extend_from_slice(&marshal(&new_data("aaaaaaaa", b"two")));

        let first = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(first[key::DATA], b"one".to_vec());
        let second = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(action_of(&second), Some(action::HEARTBEAT));
        let third = try_parse(&mut buf).unwrap().unwrap();
        assert_eq!(third[key::DATA], b"two".to_vec());
        assert!(try_parse(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(&[0; 16]);
        assert!(try_parse(&mut buf).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let wire = marshal(&new_delete("abcd1234"));
        // Chop the value of the last record.
        assert!(unmarshal(&wire[4..wire.len() - 2]).is_err());
    }
}
