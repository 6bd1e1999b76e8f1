//! Tagged-length-value envelope and its base64-substitution outer layer.
//!
//! Every length field on the wire is the true length plus the key-derived
//! offset, so payload sizes are not readable without the key. Random
//! head/tail padding records bracket each envelope; the decoder discards
//! them along with any tag it does not surface.

use std::collections::BTreeMap;

use rand::Rng;

use crate::error::{ProxyError, Result};

use super::keygen::KeyMaterial;

/// Envelope tags. Only the open range (HEAD_PAD, FORCE_REDIRECT) is
/// surfaced on decode; everything else is padding.
pub mod tag {
    pub const HEAD_PAD: u8 = 0;
    pub const DATA: u8 = 1;
    pub const COMMAND: u8 = 2;
    pub const MARK: u8 = 3;
    pub const STATUS: u8 = 4;
    pub const ERROR: u8 = 5;
    pub const IP: u8 = 6;
    pub const PORT: u8 = 7;
    pub const REDIRECT_URL: u8 = 8;
    pub const FORCE_REDIRECT: u8 = 9;
    pub const TAIL_PAD: u8 = 39;
}

/// Ordered tag → value association; BTreeMap iteration gives the stable
/// ascending tag order the wire requires.
pub type Envelope = BTreeMap<u8, Vec<u8>>;

fn random_padding() -> Vec<u8> {
    let mut rng = rand::rng();
    let len = rng.random_range(1..=19);
    let mut pad = vec![0u8; len];
    rng.fill(&mut pad[..]);
    pad
}

/// Serialize with fresh head/tail padding, tags ascending, each record as
/// `tag:u8 || (len+offset):u32 BE || value`.
pub fn blv_encode(info: &Envelope, offset: u32) -> Vec<u8> {
    let mut framed = info.clone();
    framed.insert(tag::HEAD_PAD, random_padding());
    framed.insert(tag::TAIL_PAD, random_padding());

    let mut out = Vec::with_capacity(framed.values().map(|v| v.len() + 5).sum());
    for (t, value) in &framed {
        out.push(*t);
        out.extend_from_slice(&(value.len() as u32).wrapping_add(offset).to_be_bytes());
        out.extend_from_slice(value);
    }
    out
}

/// Parse records until the input runs out, keeping only surfaced tags.
/// A length that falls below the offset, or a record cut short, is a
/// framing violation.
pub fn blv_decode(data: &[u8], offset: u32) -> Result<Envelope> {
    let mut info = Envelope::new();
    let mut rest = data;
    while !rest.is_empty() {
        if rest.len() < 5 {
            return Err(ProxyError::Protocol("truncated record header".into()));
        }
        let t = rest[0];
        let wire_len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
        let len = wire_len.wrapping_sub(offset) as i32;
        if len < 0 {
            return Err(ProxyError::Protocol("negative record length".into()));
        }
        let len = len as usize;
        rest = &rest[5..];
        if rest.len() < len {
            return Err(ProxyError::Protocol("truncated record value".into()));
        }
        if t > tag::HEAD_PAD && t < tag::FORCE_REDIRECT {
            info.insert(t, rest[..len].to_vec());
        }
        rest = &rest[len..];
    }
    Ok(info)
}

/// BLV, then standard base64, then the per-byte substitution. Bytes the
/// alphabet does not cover (`=` padding) pass through unchanged.
pub fn encode_body(info: &Envelope, material: &KeyMaterial) -> Vec<u8> {
    use base64::Engine;
    let raw = blv_encode(info, material.blv_offset);
    let mut data = base64::engine::general_purpose::STANDARD
        .encode(&raw)
        .into_bytes();
    for b in &mut data {
        *b = material.encode_map[*b as usize];
    }
    data
}

/// Reverse of [`encode_body`]; any failure yields an empty association,
/// which the read loop treats as a protocol failure (missing status).
pub fn decode_body(data: &[u8], material: &KeyMaterial) -> Envelope {
    use base64::Engine;
    let unmapped: Vec<u8> = data
        .iter()
        .map(|&b| material.decode_map[b as usize])
        // The reference decoder skips newlines.
        .filter(|&b| b != b'\r' && b != b'\n')
        .collect();
    let raw = match base64::engine::general_purpose::STANDARD.decode(&unmapped) {
        Ok(raw) => raw,
        Err(_) => return Envelope::new(),
    };
    blv_decode(&raw, material.blv_offset).unwrap_or_default()
}
