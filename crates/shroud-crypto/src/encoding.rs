//! Standard-alphabet base64 with padding, as used by every binary field in
//! the tunnel's control messages.

use crate::error::CryptoError;

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
const PAD: char = '=';

fn sextet(byte: u8) -> Option<u32> {
    match byte {
        b'A'..=b'Z' => Some(u32::from(byte - b'A')),
        b'a'..=b'z' => Some(u32::from(byte - b'a') + 26),
        b'0'..=b'9' => Some(u32::from(byte - b'0') + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Encode bytes as padded base64.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let mut group = [0u8; 3];
        group[..chunk.len()].copy_from_slice(chunk);
        let n = u32::from_be_bytes([0, group[0], group[1], group[2]]);
        // k input bytes fill k + 1 sextets; the rest of the quad is padding.
        for i in 0..4 {
            if i <= chunk.len() {
                let index = (n >> (18 - 6 * i)) & 0x3F;
                out.push(char::from(ALPHABET[index as usize]));
            } else {
                out.push(PAD);
            }
        }
    }
    out
}

/// Decode padded or unpadded base64.
///
/// Rejects characters outside the standard alphabet (including whitespace
/// and interior padding) and impossible lengths.
#[allow(clippy::cast_possible_truncation)]
pub fn decode(input: &str) -> Result<Vec<u8>, CryptoError> {
    let body = input.trim_end_matches(PAD);
    if input.len() - body.len() > 2 {
        return Err(CryptoError::Encoding("too much padding".into()));
    }
    if body.len() % 4 == 1 {
        return Err(CryptoError::Encoding(format!(
            "invalid length {}",
            body.len()
        )));
    }

    let mut out = Vec::with_capacity(body.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for byte in body.bytes() {
        let value = sextet(byte).ok_or_else(|| {
            CryptoError::Encoding(format!("invalid character {:?}", char::from(byte)))
        })?;
        acc = (acc << 6) | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}
