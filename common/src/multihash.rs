//! Canonical content-addressed identifiers: SHA-256 digests wrapped in a
//! multihash header (code + length) and base-encoded for transport.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CommonError, Result};

/// Multihash code for SHA-256, as fixed by the protocol (spec §6,
/// `hashAlgorithmInMultihashCode` default).
pub const SHA2_256: u64 = 18;

/// How a multihash's bytes are rendered as a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Base58Btc,
    Base64Url,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::Base58Btc
    }
}

/// A decoded multihash: the algorithm code and the raw digest bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMultihash {
    pub code: u64,
    pub digest: Vec<u8>,
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
    None
}

/// Hashes `content` with the algorithm named by `code` and wraps the digest
/// in a multihash header. Only [`SHA2_256`] is supported; any other code
/// fails with [`CommonError::UnsupportedHashAlgorithm`].
pub fn hash(content: &[u8], code: u64) -> Result<Vec<u8>> {
    if code != SHA2_256 {
        return Err(CommonError::UnsupportedHashAlgorithm(code));
    }

    let digest = Sha256::digest(content);
    let mut out = Vec::with_capacity(2 + digest.len());
    encode_varint(code, &mut out);
    encode_varint(digest.len() as u64, &mut out);
    out.extend_from_slice(&digest);
    Ok(out)
}

/// Parses a multihash buffer into its algorithm code and digest.
pub fn decode(bytes: &[u8]) -> Result<DecodedMultihash> {
    let (code, code_len) = decode_varint(bytes)
        .ok_or_else(|| CommonError::MalformedMultihash("missing code varint".to_string()))?;
    let rest = &bytes[code_len..];
    let (length, length_len) = decode_varint(rest)
        .ok_or_else(|| CommonError::MalformedMultihash("missing length varint".to_string()))?;
    let digest = &rest[length_len..];

    if digest.len() as u64 != length {
        return Err(CommonError::MalformedMultihash(format!(
            "declared digest length {length} does not match actual length {}",
            digest.len()
        )));
    }

    Ok(DecodedMultihash {
        code,
        digest: digest.to_vec(),
    })
}

/// Whether `bytes` is a multihash computed using `code`.
#[must_use]
pub fn is_computed_using(bytes: &[u8], code: u64) -> bool {
    decode(bytes).map(|m| m.code == code).unwrap_or(false)
}

/// Base-encodes raw multihash bytes using the chosen [`Encoding`].
#[must_use]
pub fn encode_string(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Base58Btc => bs58::encode(bytes).into_string(),
        Encoding::Base64Url => base64::encode_config(bytes, base64::URL_SAFE_NO_PAD),
    }
}

/// Decodes a base-encoded multihash string back into raw bytes.
pub fn decode_string(encoded: &str, encoding: Encoding) -> Result<Vec<u8>> {
    match encoding {
        Encoding::Base58Btc => bs58::decode(encoded)
            .into_vec()
            .map_err(|e| CommonError::EncodingError(e.to_string())),
        Encoding::Base64Url => base64::decode_config(encoded, base64::URL_SAFE_NO_PAD)
            .map_err(|e| CommonError::EncodingError(e.to_string())),
    }
}

/// Checks whether `encoded_multihash` (base-encoded) is a valid multihash of
/// `content` computed with its declared algorithm.
pub fn verify(content: &[u8], encoded_multihash: &str, encoding: Encoding) -> Result<bool> {
    let bytes = decode_string(encoded_multihash, encoding)?;
    let decoded = decode(&bytes)?;
    let recomputed = hash(content, decoded.code)?;
    Ok(recomputed == bytes)
}

/// Hashes, then hashes the digest, then encodes — used for the
/// commitment/reveal scheme: `canonicalize(value) -> hash -> hash -> encode`.
pub fn canonicalize_then_double_hash_then_encode<T: Serialize>(
    value: &T,
    code: u64,
    encoding: Encoding,
) -> Result<String> {
    let canonical = crate::canonical::canonicalize(value)?;
    let once = hash(&canonical, code)?;
    let twice = hash(&once, code)?;
    Ok(encode_string(&twice, encoding))
}

/// Convenience: hash `content` with [`SHA2_256`] and base-encode it in one
/// step, the common case callers reach for.
pub fn hash_and_encode(content: &[u8], encoding: Encoding) -> Result<String> {
    let bytes = hash(content, SHA2_256)?;
    Ok(encode_string(&bytes, encoding))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_decode_round_trips_the_code_and_digest() {
        let content = b"hello sidetree";
        let bytes = hash(content, SHA2_256).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert_eq!(decoded.code, SHA2_256);
        assert_eq!(decoded.digest, Sha256::digest(content).to_vec());
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let err = hash(b"x", 0x11).unwrap_err();
        assert!(matches!(err, CommonError::UnsupportedHashAlgorithm(0x11)));
    }

    #[test]
    fn base58_round_trips_through_encode_and_verify() {
        let content = b"some payload";
        let encoded = hash_and_encode(content, Encoding::Base58Btc).unwrap();
        assert!(verify(content, &encoded, Encoding::Base58Btc).unwrap());
        assert!(!verify(b"different payload", &encoded, Encoding::Base58Btc).unwrap());
    }

    #[test]
    fn base64url_round_trips_through_encode_and_verify() {
        let content = b"another payload";
        let encoded = hash_and_encode(content, Encoding::Base64Url).unwrap();
        assert!(verify(content, &encoded, Encoding::Base64Url).unwrap());
    }

    #[test]
    fn is_computed_using_checks_the_multihash_code() {
        let bytes = hash(b"abc", SHA2_256).unwrap();
        assert!(is_computed_using(&bytes, SHA2_256));
        assert!(!is_computed_using(&bytes, 0x11));
    }

    #[test]
    fn double_hash_commitment_differs_from_single_hash() {
        let value = serde_json::json!({"a": 1, "b": 2});
        let committed =
            canonicalize_then_double_hash_then_encode(&value, SHA2_256, Encoding::Base58Btc)
                .unwrap();
        let canonical = crate::canonical::canonicalize(&value).unwrap();
        let single = hash_and_encode(&canonical, Encoding::Base58Btc).unwrap();
        assert_ne!(committed, single);
    }
}
