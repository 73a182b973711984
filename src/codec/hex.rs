//! Hex codec - bytes to/from the textual wire alphabet.
//!
//! Frames travel as uppercase hexadecimal text between ASCII markers.
//! Encoding always produces uppercase digits; decoding accepts either case.
//!
//! # Example
//!
//! ```
//! use rtls_provider::codec::HexCodec;
//!
//! let text = HexCodec::encode(&[0xA5, 0x01, 0xFF]);
//! assert_eq!(text, b"A501FF");
//! assert_eq!(HexCodec::decode(&text).unwrap(), vec![0xA5, 0x01, 0xFF]);
//! ```

use crate::error::{Result, RtlsError};

const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Hex codec for frame bodies.
pub struct HexCodec;

impl HexCodec {
    /// Encode bytes as uppercase hex text.
    pub fn encode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() * 2);
        Self::encode_into(data, &mut out);
        out
    }

    /// Append the hex text of `data` to `out`.
    #[inline]
    pub fn encode_into(data: &[u8], out: &mut Vec<u8>) {
        for &b in data {
            out.push(DIGITS[(b >> 4) as usize]);
            out.push(DIGITS[(b & 0x0F) as usize]);
        }
    }

    /// Decode hex text into bytes.
    ///
    /// # Errors
    ///
    /// Returns `Decode` for odd-length input or non-hex characters.
    pub fn decode(text: &[u8]) -> Result<Vec<u8>> {
        if text.len() % 2 != 0 {
            return Err(RtlsError::Decode(format!(
                "odd hex length {}",
                text.len()
            )));
        }

        text.chunks_exact(2)
            .enumerate()
            .map(|(i, pair)| {
                let hi = nibble(pair[0]).ok_or_else(|| bad_char(pair[0], i * 2))?;
                let lo = nibble(pair[1]).ok_or_else(|| bad_char(pair[1], i * 2 + 1))?;
                Ok((hi << 4) | lo)
            })
            .collect()
    }
}

#[inline]
fn nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

fn bad_char(c: u8, pos: usize) -> RtlsError {
    RtlsError::Decode(format!("invalid hex character 0x{:02X} at {}", c, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uppercase() {
        assert_eq!(HexCodec::encode(&[0x00, 0xab, 0x7f]), b"00AB7F");
    }

    #[test]
    fn test_decode_mixed_case() {
        assert_eq!(HexCodec::decode(b"aBcD").unwrap(), vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_decode_empty() {
        assert!(HexCodec::decode(b"").unwrap().is_empty());
    }

    #[test]
    fn test_decode_odd_length() {
        let err = HexCodec::decode(b"ABC").unwrap_err();
        assert!(err.to_string().contains("odd hex length"));
    }

    #[test]
    fn test_decode_invalid_character() {
        let err = HexCodec::decode(b"A@").unwrap_err();
        assert!(err.to_string().contains("at 1"));
    }

    #[test]
    fn test_all_byte_values() {
        let all: Vec<u8> = (0..=255).collect();
        assert_eq!(HexCodec::decode(&HexCodec::encode(&all)).unwrap(), all);
    }
}
