//! Key-derived codec parameters.
//!
//! The user key deterministically yields three things the server derives
//! on its side from the same key: a shuffled base64 alphabet (the
//! substitution maps), a 31-bit length offset for the envelope framing,
//! and a per-session identity integer. The salt below is part of the
//! wire protocol; it is embedded verbatim in the server script.

use md5::{Digest, Md5};
use num_bigint::BigUint;
use num_traits::Zero;

use super::mt19937::Mt19937;

pub(crate) const SALT: &[u8] =
    b"11f271c6lm0e9ypkptad1uv6e1ut1fu0pt4xillz1w9bbs2gegbv89z9gca9d6tbk025uvgjfr331o0szln";

pub(crate) const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const MIN_KEY_LEN: usize = 28;

/// Everything the wire codec needs, derived once per factory from the key.
pub struct KeyMaterial {
    /// Byte-substitution tables over the base64 output; bytes outside the
    /// alphabet (`=` padding included) map to themselves.
    pub encode_map: [u8; 256],
    pub decode_map: [u8; 256],
    /// Added to every length field on the wire.
    pub blv_offset: u32,
    /// Session identity integer (`n^e mod m` over the salt halves).
    pub identity: BigUint,
}

impl KeyMaterial {
    pub fn derive(key: &str) -> Self {
        let key_hash = if key.len() < MIN_KEY_LEN {
            let mut md5 = Md5::new();
            md5.update(&SALT[..MIN_KEY_LEN]);
            md5.update(key.as_bytes());
            md5.update(&SALT[MIN_KEY_LEN..]);
            hex::encode(md5.finalize())
        } else {
            key.to_owned()
        };

        // First 28 bytes of the hash, hex-encoded as ASCII, read back as
        // a base-16 integer. Roundabout, but it is what the server does.
        let sub = &key_hash.as_bytes()[..key_hash.len().min(MIN_KEY_LEN)];
        let n = BigUint::parse_bytes(hex::encode(sub).as_bytes(), 16).unwrap_or_default();

        let e = base36(&SALT[..MIN_KEY_LEN]);
        let m = base36(&SALT[MIN_KEY_LEN..]);
        let identity = n.modpow(&e, &m);

        let mut mt = Mt19937::new();
        mt.seed_biguint(&n);

        // Draw order matters: the offset comes out of the generator
        // before the shuffle.
        let blv_offset = biguint_to_u32(&mt.getrandbits(31));

        let mut shuffled = *BASE64_ALPHABET;
        fisher_yates(&mut mt, &mut shuffled);

        let mut encode_map = [0u8; 256];
        let mut decode_map = [0u8; 256];
        for i in 0..=255u8 {
            encode_map[i as usize] = i;
            decode_map[i as usize] = i;
        }
        for i in 0..BASE64_ALPHABET.len() {
            encode_map[BASE64_ALPHABET[i] as usize] = shuffled[i];
            decode_map[shuffled[i] as usize] = BASE64_ALPHABET[i];
        }

        Self {
            encode_map,
            decode_map,
            blv_offset,
            identity,
        }
    }

    #[cfg(test)]
    pub(crate) fn shuffled_alphabet(&self) -> Vec<u8> {
        BASE64_ALPHABET
            .iter()
            .map(|&b| self.encode_map[b as usize])
            .collect()
    }
}

/// Python-`random.shuffle` order: swap down from the top, partner drawn
/// with `randbelow(i+1)`.
fn fisher_yates(mt: &mut Mt19937, items: &mut [u8]) {
    for i in (1..items.len()).rev() {
        let j = mt.randbelow(i + 1);
        items.swap(i, j);
    }
}

/// Base-36 positional value of `digits`; bytes outside `[0-9a-zA-Z]`
/// contribute zero at their position.
fn base36(digits: &[u8]) -> BigUint {
    let mut acc = BigUint::zero();
    for &b in digits {
        let val = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'z' => b - b'a' + 10,
            b'A'..=b'Z' => b - b'A' + 10,
            _ => 0,
        };
        acc = acc * 36u32 + val;
    }
    acc
}

fn biguint_to_u32(v: &BigUint) -> u32 {
    v.iter_u32_digits().next().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // All expected values in this module were generated with the CPython
    // reference implementation of the derivation.

    #[test]
    fn short_key_hash_path() {
        let material = KeyMaterial::derive("password");
        assert_eq!(material.blv_offset, 1966546385);
        assert_eq!(
            material.shuffled_alphabet(),
            b"dhULNVGsuAk/MxH6ibjcEfRqDWYznXBe9Pl7+SKoZ8pJaICgrQO0mF21yv345wtT".to_vec()
        );
        assert_eq!(
            material.identity,
            BigUint::parse_bytes(
                b"994486834200628338589994706296216174646538064466916023240683280327432407933460763059",
                10
            )
            .unwrap()
        );
    }

    #[test]
    fn long_key_skips_hashing() {
        let material = KeyMaterial::derive("this-key-is-definitely-longer-than-28-bytes");
        assert_eq!(material.blv_offset, 1925964701);
        assert_eq!(
            material.shuffled_alphabet(),
            b"nDsdXFMcI7Bxa8o39mL01VtjbSWYNGqZf+HzUe6A2Ry/K4PvilwkCpJrhuOgEQT5".to_vec()
        );
    }

    #[test]
    fn permutation_is_deterministic_and_invertible() {
        let a = KeyMaterial::derive("password");
        let b = KeyMaterial::derive("password");
        assert_eq!(a.encode_map, b.encode_map);
        assert_eq!(a.blv_offset, b.blv_offset);

        for byte in 0..=255u8 {
            assert_eq!(a.decode_map[a.encode_map[byte as usize] as usize], byte);
        }
        // '=' is outside the alphabet and passes through untouched.
        assert_eq!(a.encode_map[b'=' as usize], b'=');
        assert_eq!(a.decode_map[b'=' as usize], b'=');
    }

    #[test]
    fn base36_ignores_foreign_bytes() {
        assert_eq!(base36(b"10"), BigUint::from(36u32));
        assert_eq!(base36(b"zz"), BigUint::from(35u32 * 36 + 35));
        assert_eq!(base36(b"Zz"), base36(b"zz"));
        // '!' counts as a zero digit, shifting the place value.
        assert_eq!(base36(b"1!"), BigUint::from(36u32));
    }
}
