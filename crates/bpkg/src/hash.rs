//! SHA-256 hashing and the 64-character hex digest type shared by the
//! manifest, the Merkle tree, and the wire protocol.

use std::fmt;

use sha2::{Digest, Sha256};

/// Length in characters of a hex-encoded SHA-256 digest.
pub const HEX_LEN: usize = 64;

/// A validated 64-character lowercase hex SHA-256 digest.
///
/// Equality is byte-equal over the hex representation, matching
/// `spec.md` §3 ("Hash … comparisons are byte-equal over that
/// length").
#[derive(Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HashHex(String);

impl HashHex {
    /// Validate and wrap an existing hex string.
    pub fn parse(s: &str) -> Result<Self, HashError> {
        if s.len() != HEX_LEN {
            return Err(HashError::WrongLength(s.len()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::NotHex);
        }
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(HashError::NotLowercase);
        }
        Ok(Self(s.to_owned()))
    }

    /// Hash `bytes` with SHA-256 and wrap the resulting hex digest.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(hash_bytes(bytes))
    }

    /// Hash the concatenation of two child hex digests, as an internal
    /// Merkle node does over its children's hex strings (not their raw
    /// bytes) per `spec.md` §4.1.
    #[must_use]
    pub fn of_children(left: &HashHex, right: &HashHex) -> Self {
        let mut buf = String::with_capacity(HEX_LEN * 2);
        buf.push_str(left.as_str());
        buf.push_str(right.as_str());
        Self(hash_bytes(buf.as_bytes()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HashHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for HashHex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from parsing a hex digest.
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum HashError {
    #[error("hash must be {HEX_LEN} hex characters, got {0}")]
    WrongLength(usize),
    #[error("hash contains non-hex characters")]
    NotHex,
    #[error("hash must be lowercase")]
    NotLowercase,
}

/// Hex-encoded SHA-256 of `bytes`. Deterministic, always lowercase.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_deterministic_and_lowercase() {
        let a = hash_bytes(b"hello world");
        let b = hash_bytes(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), HEX_LEN);
        assert!(a.bytes().all(|c| !c.is_ascii_uppercase()));
        assert_eq!(
            a,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(HashHex::parse("abc"), Err(HashError::WrongLength(3)));
    }

    #[test]
    fn parse_rejects_uppercase() {
        let upper = "A".repeat(HEX_LEN);
        assert_eq!(HashHex::parse(&upper), Err(HashError::NotLowercase));
    }

    #[test]
    fn parse_rejects_non_hex() {
        let bad = "g".repeat(HEX_LEN);
        assert_eq!(HashHex::parse(&bad), Err(HashError::NotHex));
    }

    #[test]
    fn of_children_hashes_hex_strings_not_bytes() {
        let left = HashHex::of(b"left");
        let right = HashHex::of(b"right");
        let parent = HashHex::of_children(&left, &right);
        let expected = hash_bytes(format!("{left}{right}").as_bytes());
        assert_eq!(parent.as_str(), expected);
    }
}
