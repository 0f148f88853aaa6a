//! Content hash identity.
//!
//! Every pin is identified by the digest of the bytes it references.
//! The digest is computed once at ingest and never mutated.
//!
//! # Example
//!
//! ```
//! use pinsync::ContentHash;
//!
//! let h1 = ContentHash::of(b"hello");
//! let h2 = ContentHash::of(b"hello");
//! assert_eq!(h1, h2);
//!
//! let parsed: ContentHash = h1.to_string().parse().unwrap();
//! assert_eq!(parsed, h1);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Digest algorithm tag carried alongside the raw digest.
///
/// Only SHA-256 is produced today; the tag exists so stored hashes stay
/// readable if the codec ever changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashCodec {
    Sha2_256,
}

impl HashCodec {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha2_256 => "sha2-256",
        }
    }
}

#[derive(Debug, Error)]
pub enum HashParseError {
    #[error("missing codec separator in '{0}'")]
    MissingSeparator(String),
    #[error("unknown hash codec '{0}'")]
    UnknownCodec(String),
    #[error("invalid digest hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("digest length {0} != 32 bytes")]
    BadLength(usize),
}

/// Deterministic content digest used as a pin's identity.
///
/// Displayed and persisted as `sha2-256:<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ContentHash {
    codec: HashCodec,
    digest: [u8; 32],
}

impl ContentHash {
    /// Compute the digest of a byte sequence.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self {
            codec: HashCodec::Sha2_256,
            digest: digest.into(),
        }
    }

    /// Construct from a raw 32-byte digest.
    #[must_use]
    pub fn from_digest(digest: [u8; 32]) -> Self {
        Self {
            codec: HashCodec::Sha2_256,
            digest,
        }
    }

    #[must_use]
    pub fn codec(&self) -> HashCodec {
        self.codec
    }

    #[must_use]
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Hex form of the digest, without the codec tag.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// Verify that `bytes` hash to this digest.
    #[must_use]
    pub fn verify(&self, bytes: &[u8]) -> bool {
        Self::of(bytes) == *self
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.codec.as_str(), self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        write!(f, "ContentHash({}:{}..)", self.codec.as_str(), &self.to_hex()[..8])
    }
}

impl FromStr for ContentHash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (codec, hex_part) = s
            .split_once(':')
            .ok_or_else(|| HashParseError::MissingSeparator(s.to_string()))?;
        if codec != HashCodec::Sha2_256.as_str() {
            return Err(HashParseError::UnknownCodec(codec.to_string()));
        }
        let bytes = hex::decode(hex_part)?;
        let len = bytes.len();
        let digest: [u8; 32] = bytes.try_into().map_err(|_| HashParseError::BadLength(len))?;
        Ok(Self::from_digest(digest))
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.to_string()
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(ContentHash::of(b"abc"), ContentHash::of(b"abc"));
        assert_ne!(ContentHash::of(b"abc"), ContentHash::of(b"abd"));
    }

    #[test]
    fn test_display_roundtrip() {
        let h = ContentHash::of(b"roundtrip");
        let s = h.to_string();
        assert!(s.starts_with("sha2-256:"));
        let parsed: ContentHash = s.parse().unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_verify() {
        let h = ContentHash::of(b"payload");
        assert!(h.verify(b"payload"));
        assert!(!h.verify(b"tampered"));
    }

    #[test]
    fn test_parse_rejects_bad_codec() {
        let err = "md5:00".parse::<ContentHash>().unwrap_err();
        assert!(matches!(err, HashParseError::UnknownCodec(_)));
    }

    #[test]
    fn test_parse_rejects_short_digest() {
        let err = "sha2-256:0011".parse::<ContentHash>().unwrap_err();
        assert!(matches!(err, HashParseError::BadLength(2)));
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        let err = "deadbeef".parse::<ContentHash>().unwrap_err();
        assert!(matches!(err, HashParseError::MissingSeparator(_)));
    }

    #[test]
    fn test_serde_as_string() {
        let h = ContentHash::of(b"serde");
        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("sha2-256:"));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
